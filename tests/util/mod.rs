#![allow(dead_code)]

use em1140::processor::{FLAGC, FLAGN, FLAGV, FLAGZ};
use em1140::rk05::EXPECTED_IMAGE_LENGTH;
use em1140::Emulator;

pub const CODE: u16 = 0o6000; // byte address the test programs run from

pub fn blank_emulator() -> Emulator {
    Emulator::new(vec![0u8; EXPECTED_IMAGE_LENGTH]).unwrap()
}

/// A machine with `words` loaded at 06000 and the PC pointing at them.
/// The kernel stack sits below the code.
pub fn machine(words: &[u16]) -> Emulator {
    let mut em = blank_emulator();
    for (i, &w) in words.iter().enumerate() {
        em.cpu.bus.mem[(CODE >> 1) as usize + i] = w;
    }
    em.cpu.r[7] = CODE;
    em.cpu.r[6] = 0o4000;
    em
}

pub fn nzvc(em: &Emulator) -> (bool, bool, bool, bool) {
    let ps = em.cpu.ps;
    (ps & FLAGN != 0, ps & FLAGZ != 0, ps & FLAGV != 0, ps & FLAGC != 0)
}
