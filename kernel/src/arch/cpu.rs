// src/arch/cpu.rs
// CPU 命令ラッパ。unsafe は最小限。
//
// - halt_loop / outb / inb: 実機（x86 系）のみ命令を出す。
// - Cpu: fault path が必要とする CPU 状態の問い合わせと割り込み制御。
//   ページングコアはこの trait 越しにしか CPU を触らない。

use core::sync::atomic::{AtomicU32, Ordering};

use crate::mem::addr::VirtAddr;

pub fn halt_loop() -> ! {
    loop {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        core::hint::spin_loop();
    }
}

/// # Safety
/// - port への書き込みがデバイスの状態を壊さないこと。
#[inline(always)]
pub unsafe fn outb(port: u16, value: u8) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        let _ = (port, value);
    }
}

/// # Safety
/// - port からの読み出しに副作用があっても問題ないこと。
#[inline(always)]
pub unsafe fn inb(port: u16) -> u8 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let value: u8;
        core::arch::asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        value
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        let _ = port;
        0
    }
}

/// fault path から見た CPU。
pub trait Cpu {
    /// 直近の page fault のアドレス（CR2）
    fn fault_address(&self) -> VirtAddr;
    fn interrupts_enabled(&self) -> bool;
    fn enable_interrupts(&self);
    fn disable_interrupts(&self);
    fn preemption_enabled(&self) -> bool;
}

// preemption 禁止のネスト数（0 なら許可）。スケジューラと例外入口が増減する。
static PREEMPT_DISABLE_COUNT: AtomicU32 = AtomicU32::new(0);

pub fn disable_preemption() {
    PREEMPT_DISABLE_COUNT.fetch_add(1, Ordering::SeqCst);
}

pub fn enable_preemption() {
    let prev = PREEMPT_DISABLE_COUNT.fetch_sub(1, Ordering::SeqCst);
    assert!(prev > 0, "enable_preemption without matching disable");
}

pub fn is_preemption_enabled() -> bool {
    PREEMPT_DISABLE_COUNT.load(Ordering::SeqCst) == 0
}

/// 生きている間だけ preemption を禁止する（unwind でも戻る）
pub struct PreemptionDisabled(());

impl PreemptionDisabled {
    pub fn new() -> Self {
        disable_preemption();
        PreemptionDisabled(())
    }
}

impl Drop for PreemptionDisabled {
    fn drop(&mut self) {
        enable_preemption();
    }
}

/// i386 実機の Cpu
#[cfg(target_arch = "x86")]
pub struct X86Cpu;

#[cfg(target_arch = "x86")]
impl Cpu for X86Cpu {
    fn fault_address(&self) -> VirtAddr {
        let cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        VirtAddr(cr2)
    }

    fn interrupts_enabled(&self) -> bool {
        let eflags: u32;
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        eflags & (1 << 9) != 0
    }

    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }

    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
    }

    fn preemption_enabled(&self) -> bool {
        is_preemption_enabled()
    }
}
