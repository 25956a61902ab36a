use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dustbox_common::{GridDims, PlaceOffset};
use dustbox_kernel::{Element, NPART, Particle, Player, Sign, Simulation, WorldState};
use dustbox_persist::{Snapshot, decode_save, encode_save, hash_snapshot};
use glam::Vec2;
use tracing_subscriber::EnvFilter;

/// Every replay run seeds the simulation RNG with this constant at startup,
/// so a given save and frame count reproduce bit-identical state anywhere.
const REPLAY_SEED: u64 = 0x1337;

/// Environment toggle: when set, `run` prints the final snapshot digest.
const DUMP_HASH_VAR: &str = "DUMP_HASH";

#[derive(Parser)]
#[command(name = "dustbox-cli", about = "Deterministic replay harness for dustbox")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a save deterministically for a number of frames
    Run {
        /// Save file to load
        input: PathBuf,
        /// Number of frames to simulate
        frames: u64,
    },
    /// Print engine version and build constants
    Info,
    /// Write a small demonstration save
    Gen {
        /// Output path for the save file
        output: PathBuf,
        /// Playfield width in cells
        #[arg(long, default_value = "128")]
        width: u32,
        /// Playfield height in cells
        #[arg(long, default_value = "96")]
        height: u32,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    if let Err(err) = dispatch(cli.command) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run { input, frames } => cmd_run(&input, frames),
        Commands::Info => cmd_info(),
        Commands::Gen {
            output,
            width,
            height,
        } => cmd_gen(&output, width, height),
    }
}

fn cmd_run(input: &PathBuf, frames: u64) -> anyhow::Result<()> {
    let bytes = std::fs::read(input)
        .with_context(|| format!("cannot read save file {}", input.display()))?;

    // Decode failure means the simulation never starts.
    let parsed = decode_save(&bytes)
        .with_context(|| format!("save file {} is invalid", input.display()))?;

    let mut sim = Simulation::new(parsed.state.dims());
    sim.reseed(REPLAY_SEED);
    sim.load(&parsed.state, true, parsed.offset)
        .context("loading decoded state")?;

    for frame in 0..frames {
        sim.tick();
        println!("Frame {} of {}", frame + 1, frames);
    }

    if std::env::var_os(DUMP_HASH_VAR).is_some() {
        let hash = hash_snapshot(&Snapshot::capture(sim.state()));
        println!("Hash: {hash}");
    }
    Ok(())
}

fn cmd_info() -> anyhow::Result<()> {
    println!("dustbox-cli v{}", env!("CARGO_PKG_VERSION"));
    println!("save format version: {}", dustbox_persist::SAVE_VERSION);
    println!("particle capacity: {NPART}");
    println!("replay seed: {REPLAY_SEED:#x}");
    Ok(())
}

/// A compact showcase world: a floor, a dust pile over water, a sparked
/// metal line, a portal pair, a wireless link, and one player.
fn cmd_gen(output: &PathBuf, width: u32, height: u32) -> anyhow::Result<()> {
    anyhow::ensure!(
        width >= 32 && height >= 16,
        "demo world needs at least a 32x16 playfield"
    );
    let dims = GridDims::new(width, height).context("invalid playfield dimensions")?;
    let mut state = WorldState::new(dims);

    let floor = height - 2;
    for x in 0..width {
        state.block_map[dims.index(x, floor)] = dustbox_kernel::BLOCK_WALL;
    }

    let at = |x: u32, y: u32| Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
    let mid = width / 2;

    for i in 0..6u32 {
        for j in 0..3u32 {
            state.spawn(Particle::of(Element::Dust, at(mid - 3 + i, 8 + j)))?;
        }
    }
    for i in 0..8u32 {
        state.spawn(Particle::of(Element::Water, at(mid - 4 + i, floor - 2)))?;
    }

    let wire_y = floor - 6;
    let mut spark = Particle::of(Element::Spark, at(4, wire_y));
    spark.ctype = Element::Metal.tag();
    state.spawn(spark)?;
    for x in 5..5 + 10 {
        state.spawn(Particle::of(Element::Metal, at(x, wire_y)))?;
    }
    let mut tx = Particle::of(Element::Emitter, at(15, wire_y));
    tx.tmp = 1;
    state.spawn(tx)?;
    let mut rx = Particle::of(Element::Emitter, at(mid + 10, wire_y));
    rx.tmp = 1;
    state.spawn(rx)?;
    state.spawn(Particle::of(Element::Metal, at(mid + 11, wire_y)))?;

    let mut entry = Particle::of(Element::Portal, at(mid, 16));
    entry.tmp = 0;
    state.spawn(entry)?;
    let mut exit = Particle::of(Element::Portal, at(mid - 12, 16));
    exit.tmp = 0;
    exit.ctype = 1;
    state.spawn(exit)?;

    let mut anchor = Particle::of(Element::Player, at(8, 6));
    anchor.tmp = 0;
    state.spawn(anchor)?;
    state.players[0] = Player::spawned_at(at(8, 6));

    state.signs.push(Sign {
        x: mid,
        y: 6,
        text: "demo world".into(),
    });

    let bytes = encode_save(&state, PlaceOffset::ZERO).context("encoding demo save")?;
    std::fs::write(output, &bytes)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "wrote {} ({} bytes, {} particles)",
        output.display(),
        bytes.len(),
        state.live_count()
    );
    Ok(())
}
