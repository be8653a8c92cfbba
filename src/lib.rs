use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod clock;
pub mod interrupts;
pub mod memory;
pub mod mmu;
pub mod processor;
pub mod rk05;
pub mod sync;
pub mod terminal;
pub mod v6fs;

use clock::LineClock;
use interrupts::InterruptQueue;
use memory::Bus;
use processor::Cpu;
use rk05::{ImageError, Rk05};
use std::sync::atomic::AtomicU16;
use terminal::Terminal;

// RK05 bootstrap, loaded at word address 01000. Reads sector 0 to memory 0
// and clears the PC into it.
pub const BOOTROM: [u16; 29] = [
    0o042113,           // "KD"
    0o012706, 0o2000,   // MOV #boot_start, SP
    0o012700, 0o000000, // MOV #unit, R0
    0o010003,           // MOV R0, R3
    0o000303,           // SWAB R3
    0o006303,           // ASL R3
    0o006303,           // ASL R3
    0o006303,           // ASL R3
    0o006303,           // ASL R3
    0o006303,           // ASL R3
    0o012701, 0o177412, // MOV #RKDA, R1
    0o010311,           // MOV R3, (R1)         ; load da
    0o005041,           // CLR -(R1)            ; clear ba
    0o012741, 0o177000, // MOV #-256.*2, -(R1)  ; load wc
    0o012741, 0o000005, // MOV #READ+GO, -(R1)  ; read & go
    0o005002,           // CLR R2
    0o005003,           // CLR R3
    0o012704, 0o2020,   // MOV #START+20, R4
    0o005005,           // CLR R5
    0o105711,           // TSTB (R1)
    0o100376,           // BPL .-2
    0o105011,           // CLRB (R1)
    0o005007,           // CLR PC
];

pub struct Emulator {
    pub cpu: Cpu,
    intq: InterruptQueue,
    stop: Arc<AtomicBool>,
}

impl Emulator {
    pub fn new(image: Vec<u8>) -> Result<Emulator, ImageError> {
        let intq = InterruptQueue::new();
        let timer = Arc::new(Mutex::new(timer::Timer::new()));
        let cons = Terminal::new(intq.clone(), timer);
        let rk = Rk05::new(image, intq.clone())?;
        let lks = Arc::new(AtomicU16::new(1 << 7));
        let stop = Arc::new(AtomicBool::new(false));
        let bus = Bus::new(cons, rk, lks, intq.clone());
        let mut cpu = Cpu::new(bus, Arc::clone(&stop));
        cpu.reset();
        Ok(Emulator { cpu, intq, stop })
    }

    pub fn load(path: &Path) -> Result<Emulator, ImageError> {
        let image = std::fs::read(path)?;
        Emulator::new(image)
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
    }

    pub fn terminal(&self) -> Terminal {
        self.cpu.bus.cons.clone()
    }

    pub fn disk(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.cpu.bus.rk.disk)
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn ips_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.cpu.ips)
    }

    /// One instruction plus the interrupt drain that follows it.
    /// Headless drivers and tests step the machine with this.
    pub fn step(&mut self) {
        if let Err(t) = self.cpu.step() {
            let msg = t.msg.clone();
            self.cpu.trapat(t.vec, &msg);
        }
        if let Some(p) = self.intq.take_ready(self.cpu.priority()) {
            self.cpu.handle_interrupt(p.vec);
        }
    }

    /// Fire one line-clock tick by hand, for drivers that do not run the
    /// clock thread.
    pub fn tick_clock(&self) {
        clock::tick(&self.cpu.bus.lks, &self.intq);
    }

    /// The CPU loop: fetch, execute, drain interrupts, park on WAIT.
    /// Returns when the stop flag goes up (HALT or a front-end request).
    pub fn run(&mut self) {
        let _clock = LineClock::start(Arc::clone(&self.cpu.bus.lks), self.intq.clone());
        while !self.stop.load(Ordering::SeqCst) {
            if self.cpu.waiting {
                self.intq.wait_pending(Duration::from_millis(clock::TICK_MS));
                if let Some(p) = self.intq.take_ready(self.cpu.priority()) {
                    self.cpu.handle_interrupt(p.vec);
                }
                continue;
            }
            self.step();
        }
    }
}
