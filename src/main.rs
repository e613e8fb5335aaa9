//! Headless runner.
//!
//! Boots the machine from the configured ROM set, runs it on its own
//! thread, and drains frames on a presenter thread — the same split a
//! windowed host would use, minus the window.  After the requested
//! number of frames it prints the screen matrix as text.
//!
//! Usage: breadbin [--frames N] [--disk IMAGE] [--prg FILE] [--tap FILE]
//!                 [--crt FILE] [--ntsc] [--screen]

use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use breadbin::config::Config;
use breadbin::drive::DriveModel;
use breadbin::machine::{C64, VideoStandard};
use breadbin::media::cartridge::Cartridge;
use breadbin::roms::RomSet;

struct Args {
    frames: u64,
    disk: Option<String>,
    prg: Option<String>,
    tap: Option<String>,
    crt: Option<String>,
    ntsc: bool,
    show_screen: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        frames: 300,
        disk: None,
        prg: None,
        tap: None,
        crt: None,
        ntsc: false,
        show_screen: true,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--frames" => {
                if let Some(v) = it.next() {
                    args.frames = v.parse().unwrap_or(args.frames);
                }
            }
            "--disk" => args.disk = it.next(),
            "--prg" => args.prg = it.next(),
            "--tap" => args.tap = it.next(),
            "--crt" => args.crt = it.next(),
            "--ntsc" => args.ntsc = true,
            "--no-screen" => args.show_screen = false,
            "--screen" => args.show_screen = true,
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }
    args
}

fn main() {
    env_logger::init();
    let args = parse_args();
    let config = Config::load();

    let roms = match &config.rom_dir {
        Some(dir) => RomSet::load_from(dir),
        None => RomSet::load(),
    };
    let roms = match roms {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let standard = if args.ntsc {
        VideoStandard::Ntsc
    } else {
        config.video_standard()
    };

    let mut c64 = C64::power_on(&roms, standard);
    c64.cpu.set_jam_mode(config.jam_mode_policy());

    // Drives from the config; DOS ROMs are optional.
    for dc in &config.drives {
        let Some(model) = Config::drive_model(&dc.model) else {
            log::warn!("unknown drive model {:?}", dc.model);
            continue;
        };
        let drive = c64.attach_drive(dc.device, model);
        drive.set_rom(roms.drive_rom(model));
        if let Some(image) = &dc.image {
            if let Err(e) = c64.insert_disk(dc.device, image) {
                log::warn!("cannot mount {image}: {e}");
            }
        }
    }

    if let Some(path) = args.disk.as_deref() {
        if c64.drive(8).is_none() {
            c64.attach_drive(8, DriveModel::D1541);
        }
        if let Err(e) = c64.insert_disk(8, path) {
            eprintln!("cannot mount {path}: {e}");
            std::process::exit(1);
        }
    }
    if let Some(path) = args.prg.as_deref().or(config.autostart_prg.as_deref()) {
        if let Err(e) = c64.media.attach_prg(path) {
            eprintln!("cannot load {path}: {e}");
            std::process::exit(1);
        }
    }
    if let Some(path) = args.tap.as_deref() {
        match std::fs::read(path) {
            Ok(bytes) => {
                if let Err(e) = c64.cassette.load_tap(&bytes) {
                    eprintln!("cannot load {path}: {e}");
                    std::process::exit(1);
                }
                c64.cassette.play();
            }
            Err(e) => {
                eprintln!("cannot read {path}: {e}");
                std::process::exit(1);
            }
        }
    }
    if let Some(path) = args.crt.as_deref() {
        match Cartridge::load(path) {
            Ok(cart) => {
                c64.bus
                    .pla
                    .set_cartridge_lines(cart.exrom_line(), cart.game_line());
                c64.bus.pla.set_cartridge_attached(true);
                c64.bus.cart = Some(cart);
                c64.reset();
            }
            Err(e) => {
                eprintln!("cannot load {path}: {e}");
                std::process::exit(1);
            }
        }
    }

    // Presenter thread: drains the frame queue like a windowed host,
    // counting what it sees.
    let queue = c64.frame_queue();
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let presenter = thread::spawn(move || {
        let mut presented = 0u64;
        loop {
            if queue.with_frame(|_| ()).is_some() {
                presented += 1;
            }
            if stop_rx.try_recv().is_ok() {
                break presented;
            }
            thread::sleep(Duration::from_millis(2));
        }
    });

    let target = args.frames;
    while c64.frames_rendered() < target {
        c64.run_frame();
    }

    let _ = stop_tx.send(());
    let presented = presenter.join().unwrap_or(0);

    log::info!(
        "ran {} frames ({} cycles), presenter saw {}",
        c64.frames_rendered(),
        c64.cpu.total_cycles(),
        presented
    );

    if args.show_screen {
        println!("{}", c64.screen_text());
    }
}
