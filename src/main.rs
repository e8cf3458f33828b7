// Host frontend: command line, window, audio stream and the outer
// emulation loop. The library is headless; everything host-facing is bound
// here.

use clap::Parser;
use emz80::config::FileConfig;
use emz80::debugger::{self, DbgState};
use emz80::gdb::GdbServer;
use emz80::machine::{Machine, MachineConfig};
use emz80::us_to_tstates;
use emz80::vpu::{MAX_RES_HEIGHT, MAX_RES_WIDTH};
use minifb::{Window, WindowOptions};
use rodio::{OutputStream, Source};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "emz80", about = "Emulator for a Z80-based 8-bit retrocomputer")]
struct Args {
    /// NOR flash (ROM) image to boot from
    #[arg(long)]
    rom: Option<PathBuf>,

    /// User program patched into the romdisk, `file[,hexaddr]`
    #[arg(long)]
    uprog: Option<String>,

    /// EEPROM image
    #[arg(long)]
    eeprom: Option<PathBuf>,

    /// TF card image
    #[arg(long)]
    tf: Option<PathBuf>,

    /// CompactFlash image
    #[arg(long)]
    cf: Option<PathBuf>,

    /// Host directory mounted for the guest
    #[arg(long)]
    hostfs: Option<PathBuf>,

    /// Symbol map file
    #[arg(long)]
    map: Option<PathBuf>,

    /// Configuration file with default paths
    #[arg(long)]
    config: Option<PathBuf>,

    /// Font binary loaded into the video board
    #[arg(long)]
    font: Option<PathBuf>,

    /// Start the terminal debugger, paused
    #[arg(long)]
    debug: bool,

    /// Comma-separated breakpoint list (addresses or symbols)
    #[arg(long)]
    breakpoints: Option<String>,

    /// Serve a GDB remote stub on this port instead of running freely
    #[arg(long)]
    gdb: Option<u16>,

    /// Run without window and audio
    #[arg(long)]
    headless: bool,

    /// Exit when PC returns to 0x0000 (software reset)
    #[arg(long)]
    no_reset: bool,
}

fn main() {
    env_logger::init();
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();
    let file_config = match &args.config {
        Some(path) => FileConfig::load(path),
        None => FileConfig::default(),
    };

    let rom = args.rom.or_else(|| file_config.rom.as_ref().map(PathBuf::from));
    if rom.is_none() {
        log::error!("no ROM image specified, use --rom or a config file");
        return 1;
    }

    let config = MachineConfig {
        rom,
        userprog: args.uprog,
        eeprom: args.eeprom.or_else(|| file_config.eeprom.as_ref().map(PathBuf::from)),
        compactflash: args.cf.or_else(|| file_config.compactflash.as_ref().map(PathBuf::from)),
        tf_image: args.tf.or_else(|| file_config.tf_image.as_ref().map(PathBuf::from)),
        hostfs_root: args.hostfs.or_else(|| file_config.hostfs_root.as_ref().map(PathBuf::from)),
        exit_on_pc_zero: args.no_reset,
    };

    let mut machine = match Machine::new(config) {
        Ok(machine) => machine,
        Err(err) => {
            log::error!("error initializing the machine: {}", err);
            return 1;
        }
    };

    if let Some(font) = args.font.or_else(|| file_config.font.as_ref().map(PathBuf::from)) {
        match std::fs::read(&font) {
            Ok(data) => machine.load_font(&data),
            Err(err) => log::error!("could not load font {}: {}", font.display(), err),
        }
    }

    if let Some(map) = args.map.or_else(|| file_config.map_file.as_ref().map(PathBuf::from)) {
        machine.debugger.load_symbols(&map);
    }
    if let Some(list) = &args.breakpoints {
        machine.debugger.set_breakpoints_str(list);
    }

    if let Some(port) = args.gdb {
        return run_gdb(&mut machine, port);
    }

    if args.headless {
        return run_headless(&mut machine, args.debug);
    }

    run_windowed(&mut machine, args.debug)
}

fn run_gdb(machine: &mut Machine, port: u16) -> i32 {
    let server = match GdbServer::bind(port) {
        Ok(server) => server,
        Err(err) => {
            log::error!("could not start GDB server: {}", err);
            return 1;
        }
    };
    match server.serve(machine) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("GDB session failed: {}", err);
            1
        }
    }
}

fn run_headless(machine: &mut Machine, debug: bool) -> i32 {
    if debug {
        machine.set_dbg_state(DbgState::Paused);
    }
    while !machine.should_exit() {
        if debug {
            if machine.dbg_state() == DbgState::Paused {
                debugger::shell_prompt(machine);
            } else {
                machine.debug_step();
            }
        } else {
            machine.step();
        }
    }
    0
}

fn run_windowed(machine: &mut Machine, debug: bool) -> i32 {
    let mut window = match Window::new("emz80", MAX_RES_WIDTH, MAX_RES_HEIGHT, WindowOptions::default()) {
        Ok(window) => window,
        Err(err) => {
            log::error!("could not open the window: {}", err);
            return 1;
        }
    };
    // Presenting at most one frame per 16.6ms paces the emulation close to
    // the real 10MHz part
    window.limit_update_rate(Some(Duration::from_micros(16600)));

    // The stream must stay alive for the callback to keep running
    let _audio = match OutputStream::try_default() {
        Ok((stream, handle)) => {
            if let Some(source) = machine.sound_source() {
                if let Err(err) = handle.play_raw(source.convert_samples()) {
                    log::warn!("could not start audio stream: {}", err);
                }
            }
            Some((stream, handle))
        }
        Err(err) => {
            log::warn!("no audio output available: {}", err);
            None
        }
    };

    let mut framebuffer = vec![0u32; MAX_RES_WIDTH * MAX_RES_HEIGHT];
    let poll_period = us_to_tstates(15000.0);
    if debug {
        machine.set_dbg_state(DbgState::Paused);
    }

    while window.is_open() && !machine.should_exit() {
        let elapsed = if debug {
            if machine.dbg_state() == DbgState::Paused {
                debugger::shell_prompt(machine);
                0
            } else {
                machine.debug_step()
            }
        } else {
            machine.step()
        };

        if machine.keyboard_poll_due(elapsed) {
            let keys = window.get_keys().unwrap_or_default();
            machine.host_keys_update(&keys, poll_period);
        }

        if machine.take_need_render() {
            machine.render_frame(&mut framebuffer);
            if let Err(err) = window.update_with_buffer(&framebuffer, MAX_RES_WIDTH, MAX_RES_HEIGHT) {
                log::error!("could not update the window: {}", err);
                break;
            }
        }
    }

    0
}
