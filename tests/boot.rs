// End-to-end boot of Version 6 Unix. Needs the distributed rk0.img, which
// is not part of the tree: point RK0_IMAGE at it and run with --ignored.

use em1140::Emulator;
use std::path::PathBuf;

const MAX_STEPS: u64 = 2_000_000_000;
// one line-clock tick per ~40000 instructions approximates 50 Hz
const STEPS_PER_TICK: u64 = 40_000;

fn image_path() -> Option<PathBuf> {
    std::env::var_os("RK0_IMAGE").map(PathBuf::from)
}

/// Run until `pattern` shows up in the terminal output, feeding clock ticks.
fn run_until(em: &mut Emulator, seen: &mut Vec<u8>, pattern: &[u8], limit: u64) -> bool {
    let term = em.terminal();
    for i in 0..limit {
        em.step();
        if i % STEPS_PER_TICK == 0 {
            em.tick_clock();
        }
        while let Some(c) = term.pull_output() {
            seen.push(c);
        }
        if seen.ends_with(pattern) {
            return true;
        }
    }
    false
}

#[test]
#[ignore]
fn boots_to_the_root_prompt_and_echoes() {
    let path = match image_path() {
        Some(p) => p,
        None => {
            eprintln!("RK0_IMAGE not set, skipping");
            return;
        }
    };
    let mut em = Emulator::load(&path).expect("loading rk0.img");
    let term = em.terminal();
    let mut seen = Vec::new();

    // the secondary boot announces itself with the @ prompt
    assert!(run_until(&mut em, &mut seen, b"@", MAX_STEPS), "no boot prompt");
    term.paste(b"unix\n");
    assert!(run_until(&mut em, &mut seen, b"# ", MAX_STEPS), "no root prompt");

    let before = seen.len();
    term.paste(b"echo hello\n");
    assert!(run_until(&mut em, &mut seen, b"# ", 200_000_000), "echo never returned");
    let reply = &seen[before..];
    let text = String::from_utf8_lossy(reply);
    assert!(text.contains("hello\n"), "terminal said: {:?}", text);
    assert!(!reply.contains(&0x0D), "carriage returns leaked through");
}
