// kernel/src/panic.rs
//
// 致命経路の出力と停止。
// - 挙動は「緊急出力（ロック無し） → CPU 停止」に固定する。
// - VGA や logging の Mutex は使わない（保持したまま fault している可能性がある）。
// - 二重 panic は即停止（再入で #DF になりやすい）
//
// EmergencyDiagnostics は fault dispatcher の報告先（実機用）。
// panic ハンドラ本体は bare metal のときだけ定義する。

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::arch::interrupts::{Diagnostics, FaultReport, Symbol};

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub fn in_panic() -> bool {
    PANIC_IN_PROGRESS.load(Ordering::SeqCst)
}

// ─────────────────────────────────────────────
// 緊急出力（ロック無し）
// - QEMU debugcon(0xE9) と COM1(0x3F8)
// ─────────────────────────────────────────────

fn emergency_write_byte(b: u8) {
    if !cfg!(target_os = "none") {
        return;
    }

    unsafe {
        use crate::arch::cpu::{inb, outb};

        // QEMU debugcon
        outb(0xE9, b);

        // COM1
        for _ in 0..10_000 {
            if (inb(0x3FD) & 0x20) != 0 {
                break;
            }
        }
        outb(0x3F8, b);
    }
}

fn emergency_write_str(s: &str) {
    for b in s.bytes() {
        emergency_write_byte(b);
    }
}

struct EmergencyWriter;

impl Write for EmergencyWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        emergency_write_str(s);
        Ok(())
    }
}

/// シンボル表の検索関数（kernel image 側が提供する）
pub type SymbolLookup = fn(u32) -> Option<Symbol>;

/// 実機用の報告先
pub struct EmergencyDiagnostics {
    symbols: Option<SymbolLookup>,
}

impl EmergencyDiagnostics {
    pub const fn new(symbols: Option<SymbolLookup>) -> Self {
        EmergencyDiagnostics { symbols }
    }
}

impl Diagnostics for EmergencyDiagnostics {
    fn in_panic(&self) -> bool {
        in_panic()
    }

    fn resolve_symbol(&self, addr: u32) -> Option<Symbol> {
        self.symbols.and_then(|lookup| lookup(addr))
    }

    fn fatal(&self, report: &FaultReport) -> ! {
        if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
            emergency_write_str("[PANIC] re-entered => halt\n");
            arch::halt_loop();
        }

        emergency_write_str("[PANIC] ");
        let _ = write!(EmergencyWriter, "{}", report);
        arch::halt_loop()
    }

    fn halt_forever(&self, msg: &str) -> ! {
        emergency_write_str("[PANIC] ");
        emergency_write_str(msg);
        emergency_write_str("\n");
        arch::halt_loop()
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    // 二重 panic は即停止（再入すると #DF になりやすい）
    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        emergency_write_str("[PANIC] re-entered => halt\n");
        return arch::halt_loop();
    }

    emergency_write_str("[PANIC] kernel panic: ");
    let _ = write!(EmergencyWriter, "{}", info.message());

    if let Some(loc) = info.location() {
        let _ = write!(EmergencyWriter, "\n[PANIC] at {}:{}:{}\n", loc.file(), loc.line(), loc.column());
    } else {
        emergency_write_str("\n[PANIC] location unknown\n");
    }

    arch::halt_loop()
}
