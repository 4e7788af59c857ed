// kernel/src/logging/serial.rs
//
// COM1 (0x3F8) への最小限のシリアル出力。
// - init(): 115200bps, 8N1 に初期化
// - write_str(): 文字列を送信
// - write_line(): 文字列＋改行を送信
//
// 実機（target_os = "none"）以外では何も出さない（ホストのテストで port I/O をしない）。

use core::sync::atomic::{AtomicBool, Ordering};

const COM1: u16 = 0x3F8;

static SERIAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

const fn enabled() -> bool {
    cfg!(target_os = "none")
}

pub fn init() {
    if !enabled() || SERIAL_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    unsafe {
        use crate::arch::cpu::outb;

        outb(COM1 + 1, 0x00); // 割り込み無効

        outb(COM1 + 3, 0x80); // DLAB
        outb(COM1, 0x01); // 115200bps
        outb(COM1 + 1, 0x00);

        outb(COM1 + 3, 0x03); // 8N1
        outb(COM1 + 2, 0xC7);
        outb(COM1 + 4, 0x0B);
    }
}

fn write_byte(byte: u8) {
    if !enabled() {
        return;
    }

    unsafe {
        use crate::arch::cpu::{inb, outb};

        while (inb(COM1 + 5) & 0x20) == 0 {}
        outb(COM1, byte);
    }
}

pub fn write_str(s: &str) {
    for b in s.bytes() {
        write_byte(b);
    }
}

pub fn write_line(s: &str) {
    write_str(s);
    write_str("\r\n");
}

pub fn write_prefixed_line(prefix: &str, msg: &str) {
    write_str(prefix);
    write_line(msg);
}
