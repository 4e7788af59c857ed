// kernel/src/logging/mod.rs
//
// 固定文字列 + u64 だけのログ（heap / format! を使わない）。
// 出力先は VGA と COM1。どちらも実機でだけ有効で、ホストでは何もしない。

mod vga;
mod serial;

pub fn init() {
    vga::init();
    serial::init();
}

pub fn info(msg: &str) {
    vga::write_prefixed_line("[INFO] ", msg);
    serial::write_prefixed_line("[INFO] ", msg);
}

pub fn error(msg: &str) {
    vga::write_prefixed_line("[ERROR] ", msg);
    serial::write_prefixed_line("[ERROR] ", msg);
}

/// `[INFO] key = value`（key が空なら値だけ）
pub fn info_u64(key: &str, value: u64) {
    let mut buf = [0u8; 20];
    let s = u64_to_decimal(value, &mut buf);

    if key.is_empty() {
        vga::write_str("[INFO] ");
        vga::write_line(s);
        serial::write_str("[INFO] ");
        serial::write_line(s);
        return;
    }

    vga::write_str("[INFO] ");
    vga::write_str(key);
    vga::write_str(" = ");
    vga::write_line(s);

    serial::write_str("[INFO] ");
    serial::write_str(key);
    serial::write_str(" = ");
    serial::write_line(s);
}

fn u64_to_decimal(mut value: u64, buf: &mut [u8; 20]) -> &str {
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }

    // ASCII 数字しか書いていない
    core::str::from_utf8(&buf[i..]).unwrap_or("?")
}
