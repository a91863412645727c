use emgba::gba::{self, KeyButtons, ALL_KEYS_RELEASED};
use emgba::processor::{DebugCommand, Debugger};
use emgba::video::{FRAME_HEIGHT, FRAME_WIDTH};
use emgba::{Emulator, Fault, Shared};
use minifb::{Key, Scale, Window, WindowOptions};
use std::env;
use std::fs;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let paths: Vec<&String> = args[1..].iter().filter(|arg| !arg.starts_with("--")).collect();
    if paths.len() != 2 {
        eprintln!("usage: mygba <bios> <rom> [--debug]");
        process::exit(2);
    }
    let debug = args.iter().any(|arg| arg == "--debug");
    let bios = read_image(paths[0]);
    let rom = read_image(paths[1]);

    let shared = Shared::default();
    let (command_tx, command_rx) = mpsc::sync_channel::<DebugCommand>(16);

    // The worker owns the whole core; only the key register, kill flag and
    // frame buffer are shared with this thread.
    let worker_shared = shared.clone();
    let worker = thread::spawn(move || {
        let mut emulator = Emulator::new(gba::agb(), worker_shared);
        emulator.load_bios(&bios);
        emulator.load_rom(&rom);
        emulator.run(command_rx, debug);
    });

    if debug {
        let prompt_tx = command_tx.clone();
        thread::spawn(move || {
            let mut debugger = Debugger::new();
            loop {
                let command = debugger.read_command();
                let quit = command == DebugCommand::Quit;
                if prompt_tx.send(command).is_err() || quit {
                    break;
                }
            }
        });
    }

    let mut window = Window::new(
        "mygba",
        FRAME_WIDTH,
        FRAME_HEIGHT,
        WindowOptions { scale: Scale::X2, ..WindowOptions::default() },
    )
    .unwrap_or_else(|e| {
        panic!("{}", e);
    });
    window.limit_update_rate(Some(Duration::from_micros(16600)));

    let mut buffer = vec![0u32; FRAME_WIDTH * FRAME_HEIGHT];
    while window.is_open()
        && !window.is_key_down(Key::Escape)
        && !shared.kill.load(Ordering::Relaxed)
    {
        shared.keys.store(key_status(&window), Ordering::Relaxed);
        {
            let frame = shared.frame.lock().expect("frame buffer poisoned");
            for (slot, &pixel) in frame.iter().enumerate() {
                buffer[slot] = rgb555_to_host(pixel);
            }
        }
        window
            .update_with_buffer(&buffer, FRAME_WIDTH, FRAME_HEIGHT)
            .expect("Error updating screen!");
    }

    shared.kill.store(true, Ordering::Relaxed);
    drop(command_tx);
    worker.join().expect("emulation worker panicked");
}

fn read_image(path: &str) -> Vec<u8> {
    match fs::read(path) {
        Ok(bytes) => bytes,
        Err(source) => {
            eprintln!("{}", Fault::Io { path: path.to_string(), source });
            process::exit(1);
        }
    }
}

/// Sample the host keyboard into the 10-bit key register (0 = pressed).
fn key_status(window: &Window) -> u16 {
    let mapping = [
        (Key::A, KeyButtons::A),
        (Key::B, KeyButtons::B),
        (Key::Enter, KeyButtons::SELECT),
        (Key::Space, KeyButtons::START),
        (Key::Right, KeyButtons::RIGHT),
        (Key::Left, KeyButtons::LEFT),
        (Key::Up, KeyButtons::UP),
        (Key::Down, KeyButtons::DOWN),
        (Key::W, KeyButtons::R),
        (Key::Q, KeyButtons::L),
    ];
    let mut status = ALL_KEYS_RELEASED;
    for (key, button) in mapping.iter() {
        if window.is_key_down(*key) {
            status &= !button.bits();
        }
    }
    status
}

/// Expand packed 5-bit channels to the presenter's 8-bit 0RGB layout.
fn rgb555_to_host(color: u16) -> u32 {
    let r = ((color & 0x1f) << 3) as u32;
    let g = (((color >> 5) & 0x1f) << 3) as u32;
    let b = (((color >> 10) & 0x1f) << 3) as u32;
    (r << 16) | (g << 8) | b
}
