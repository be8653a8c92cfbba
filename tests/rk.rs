// Driving the RK05 through its bus registers, the way the boot ROM and the
// V6 driver do.

use em1140::rk05::EXPECTED_IMAGE_LENGTH;
use em1140::Emulator;

fn patterned_image() -> Vec<u8> {
    let mut image = vec![0u8; EXPECTED_IMAGE_LENGTH];
    for (i, b) in image.iter_mut().enumerate().take(4096) {
        *b = (i * 7 % 251) as u8;
    }
    image
}

#[test]
fn register_programmed_read_write_read() {
    let mut em = Emulator::new(patterned_image()).unwrap();
    let image = em.disk();
    let first_word = {
        let d = image.lock().unwrap();
        d[0] as u16 | ((d[1] as u16) << 8)
    };

    // read cylinder 0, surface 0, sector 0: 256 words to BA=0
    em.cpu.physwrite16(0o777412, 0).unwrap();
    em.cpu.physwrite16(0o777410, 0).unwrap();
    em.cpu.physwrite16(0o777406, (0x10000 - 256) as u16).unwrap();
    em.cpu.physwrite16(0o777404, 0o005).unwrap(); // READ|GO
    assert_eq!(em.cpu.bus.mem[0], first_word);
    assert_ne!(em.cpu.physread16(0o777404).unwrap() & (1 << 7), 0);

    // write the same region back, then re-read and compare
    let golden: Vec<u16> = em.cpu.bus.mem[..256].to_vec();
    em.cpu.physwrite16(0o777412, 0).unwrap();
    em.cpu.physwrite16(0o777410, 0).unwrap();
    em.cpu.physwrite16(0o777406, (0x10000 - 256) as u16).unwrap();
    em.cpu.physwrite16(0o777404, 0o003).unwrap(); // WRITE|GO
    for w in em.cpu.bus.mem[..256].iter_mut() {
        *w = 0;
    }
    em.cpu.physwrite16(0o777412, 0).unwrap();
    em.cpu.physwrite16(0o777410, 0).unwrap();
    em.cpu.physwrite16(0o777406, (0x10000 - 256) as u16).unwrap();
    em.cpu.physwrite16(0o777404, 0o005).unwrap();
    assert_eq!(&em.cpu.bus.mem[..256], &golden[..]);
}

#[test]
fn multi_sector_read_advances_the_head() {
    let mut em = Emulator::new(patterned_image()).unwrap();
    // sectors 0..4 in one transfer: 4 * 256 words
    em.cpu.physwrite16(0o777412, 0).unwrap();
    em.cpu.physwrite16(0o777410, 0).unwrap();
    em.cpu.physwrite16(0o777406, (0x10000 - 1024) as u16).unwrap();
    em.cpu.physwrite16(0o777404, 0o005).unwrap();
    let image = em.disk();
    let d = image.lock().unwrap();
    for i in 0..1024 {
        let w = d[2 * i] as u16 | ((d[2 * i + 1] as u16) << 8);
        assert_eq!(em.cpu.bus.mem[i], w, "word {}", i);
    }
    assert_eq!(em.cpu.physread16(0o777412).unwrap() & 0xF, 4);
}

#[test]
fn disk_address_register_packs_geometry() {
    let mut em = Emulator::new(patterned_image()).unwrap();
    let da = (0o100 << 5) | (1 << 4) | 0o07;
    em.cpu.physwrite16(0o777412, da).unwrap();
    assert_eq!(em.cpu.physread16(0o777412).unwrap(), da);
}

#[test]
fn boot_rom_is_in_place_after_reset() {
    let em = Emulator::new(patterned_image()).unwrap();
    assert_eq!(em.cpu.bus.mem[0o1000], 0o042113);
    assert_eq!(em.cpu.bus.mem[0o1001], 0o012706);
    assert_eq!(em.cpu.r[7], 0o2002);
}

#[test]
fn boot_rom_loads_sector_zero_and_jumps() {
    // Execute the ROM itself: it programs the RK05 and lands at PC=0 with
    // the first sector in low memory.
    let mut image = patterned_image();
    // plant a HALT at guest word 0 so the "loaded system" stops cleanly
    image[0] = 0;
    image[1] = 0;
    let mut em = Emulator::new(image).unwrap();
    let stop = em.stop_handle();
    for _ in 0..200 {
        em.step();
        if stop.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
    }
    assert!(stop.load(std::sync::atomic::Ordering::SeqCst), "boot ROM never reached the loaded code");
    // sector 0 words are in memory
    let image = em.disk();
    let d = image.lock().unwrap();
    for i in 1..256 {
        assert_eq!(em.cpu.bus.mem[i], d[2 * i] as u16 | ((d[2 * i + 1] as u16) << 8));
    }
}
