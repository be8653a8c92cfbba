// Console TTY: the four registers at 777560..777566, the keyboard buffer
// with its paste queue, and the output stream any front-end drains.
//
// Everything behind one mutex: the CPU thread works the registers while a
// front-end thread feeds keys and pulls output.

use crate::interrupts::{InterruptQueue, INT_TTYIN, INT_TTYOUT};
use chrono::Duration;
use log::debug;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

// Keep a bounded backlog when nobody is pulling output.
const OUTPUT_BACKLOG: usize = 1 << 16;

struct QueuedCommand {
    line: String,
    done: Sender<()>,
}

struct Tty {
    tks: u16,
    tps: u16,
    keybuf: u8,
    input: VecDeque<u8>,
    output: VecDeque<u8>,
    col: usize,
    line_first: u8,
    prompt_cnt: u64,
    at_prompt: bool,
    commands: VecDeque<QueuedCommand>,
    inflight: Option<Sender<()>>,
}

#[derive(Clone)]
pub struct Terminal {
    inner: Arc<Mutex<Tty>>,
    intq: InterruptQueue,
    timer: Arc<Mutex<timer::Timer>>,
}

impl Terminal {
    pub fn new(intq: InterruptQueue, timer: Arc<Mutex<timer::Timer>>) -> Terminal {
        Terminal {
            inner: Arc::new(Mutex::new(Tty {
                tks: 0,
                tps: 1 << 7,
                keybuf: 0,
                input: VecDeque::new(),
                output: VecDeque::new(),
                col: 0,
                line_first: 0,
                prompt_cnt: 0,
                at_prompt: false,
                commands: VecDeque::new(),
                inflight: None,
            })),
            intq,
            timer,
        }
    }

    pub fn reset(&self) {
        let mut t = self.inner.lock().unwrap();
        t.tks = 0;
        t.tps = 1 << 7;
    }

    pub fn read16(&self, a: u32) -> u16 {
        let mut t = self.inner.lock().unwrap();
        match a {
            0o777560 => t.tks,
            0o777562 => self.getchar(&mut t),
            0o777564 => t.tps,
            0o777566 => 0,
            _ => panic!("invalid TTY read {:06o}", a),
        }
    }

    pub fn write16(&self, a: u32, v: u16) {
        let mut t = self.inner.lock().unwrap();
        match a {
            0o777560 => {
                if v & (1 << 6) != 0 {
                    t.tks |= 1 << 6;
                } else {
                    t.tks &= !(1 << 6);
                }
            }
            0o777562 => {} // keyboard buffer, writes ignored
            0o777564 => {
                if v & (1 << 6) != 0 {
                    t.tps |= 1 << 6;
                } else {
                    t.tps &= !(1 << 6);
                }
            }
            0o777566 => {
                let v = (v & 0xFF) as u8;
                if t.tps & 0x80 == 0 {
                    return;
                }
                if v == 0x0D {
                    return;
                }
                self.emit(&mut t, v & 0x7F);
                t.tps &= 0xff7f;
                let reenable = t.tps & (1 << 6) != 0;
                let inner = Arc::clone(&self.inner);
                let intq = self.intq.clone();
                self.timer
                    .lock()
                    .unwrap()
                    .schedule_with_delay(Duration::milliseconds(1), move || {
                        inner.lock().unwrap().tps |= 0x80;
                        if reenable {
                            intq.post(INT_TTYOUT, 4);
                        }
                    })
                    .ignore();
            }
            _ => panic!("invalid TTY write {:06o}", a),
        }
    }

    fn getchar(&self, t: &mut Tty) -> u16 {
        if t.tks & 0x80 != 0 {
            t.tks &= 0xff7e;
            t.at_prompt = false;
            let c = t.keybuf;
            if let Some(next) = t.input.pop_front() {
                self.addchar(t, next);
            }
            return c as u16;
        }
        0
    }

    fn addchar(&self, t: &mut Tty, c: u8) {
        t.tks |= 0x80;
        t.keybuf = c;
        if t.tks & (1 << 6) != 0 {
            self.intq.post(INT_TTYIN, 4);
        }
    }

    fn push_key(&self, t: &mut Tty, c: u8) {
        if t.tks & 0x80 != 0 || !t.input.is_empty() {
            t.input.push_back(c);
        } else {
            self.addchar(t, c);
        }
    }

    /// Front-end contract: feed one typed or pasted byte.
    pub fn read_key_press(&self, c: u8) {
        let mut t = self.inner.lock().unwrap();
        t.at_prompt = false;
        self.push_key(&mut t, c);
    }

    pub fn paste(&self, bytes: &[u8]) {
        let mut t = self.inner.lock().unwrap();
        t.at_prompt = false;
        for &c in bytes {
            self.push_key(&mut t, c);
        }
    }

    /// Front-end contract: non-blocking pull of the next emitted byte.
    pub fn pull_output(&self) -> Option<u8> {
        self.inner.lock().unwrap().output.pop_front()
    }

    fn emit(&self, t: &mut Tty, c: u8) {
        if t.output.len() >= OUTPUT_BACKLOG {
            t.output.pop_front();
        }
        t.output.push_back(c);
        if c == b'\n' {
            t.col = 0;
        } else {
            if t.col == 0 {
                t.line_first = c;
            }
            if t.col == 1 && t.line_first == b'#' && c == b' ' {
                self.prompt_event(t);
            }
            t.col += 1;
        }
    }

    // A shell prompt surfaced: release the next queued command line and
    // acknowledge the one that just finished.
    fn prompt_event(&self, t: &mut Tty) {
        t.prompt_cnt += 1;
        if let Some(done) = t.inflight.take() {
            let _ = done.send(());
        }
        if let Some(cmd) = t.commands.pop_front() {
            self.dispatch(t, cmd);
        } else {
            t.at_prompt = true;
        }
    }

    fn dispatch(&self, t: &mut Tty, cmd: QueuedCommand) {
        debug!("sending to guest: {}", cmd.line);
        for &c in cmd.line.as_bytes() {
            self.push_key(t, c);
        }
        self.push_key(t, b'\n');
        t.inflight = Some(cmd.done);
        t.at_prompt = false;
    }

    /// Queue a shell command for the next prompt. The receiver fires at the
    /// prompt that follows the command's completion.
    pub fn queue_command(&self, line: &str) -> Receiver<()> {
        let (tx, rx) = channel();
        let mut t = self.inner.lock().unwrap();
        let cmd = QueuedCommand { line: line.to_string(), done: tx };
        if t.at_prompt && t.inflight.is_none() {
            self.dispatch(&mut t, cmd);
        } else {
            t.commands.push_back(cmd);
        }
        rx
    }

    /// Queue a command and block until the guest is back at a prompt.
    pub fn command_wait(&self, line: &str) {
        let rx = self.queue_command(line);
        let _ = rx.recv();
    }

    pub fn prompt_count(&self) -> u64 {
        self.inner.lock().unwrap().prompt_cnt
    }

    /// Boot convenience: answer the boot loader, then soften the console.
    pub fn start_routine(&self) {
        self.paste(b"unix\n");
        let _ = self.queue_command("stty -lcase");
    }
}
