// kernel/src/arch/interrupts.rs
//
// 役割:
// - #PF / #GP の例外処理本体（どの例外入口から呼ばれても同じ判断をする部分）。
// - 例外の登録先（IDT 相当）と、致命時の報告先を trait で受け取る。
//
// 設計方針:
// - #PF は「既に panic 中なら停止」→ 入口条件の assert → 割り込み許可 → COW 解決
//   → 割り込み禁止、の順に固定する。
// - COW で解決できなかった #PF と、すべての #GP は fail-stop（報告して停止）。
// - 報告中のシンボル解決は resumable_call の中で行い、そこで起きた #PF は
//   ResumeAfterFault で入口スタブに返す（報告は "???" に落ちる）。
//
// 重要:
// - error code のビット配置は i386 / x86_64 で同じなので、
//   x86_64 crate の PageFaultErrorCode でデコードする。

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::structures::idt::PageFaultErrorCode;

use crate::mem::addr::VirtAddr;
use crate::mem::address_space::VmError;
use crate::mem::cow::CowOutcome;

use super::cpu::Cpu;

/// 扱う例外（値はベクタ番号）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    GeneralProtection = 13,
    PageFault = 14,
}

/// 例外入口スタブから渡される最小限のフレーム
#[derive(Clone, Copy, Debug)]
pub struct FaultFrame {
    pub error_code: u32,
    pub eip: u32,
}

/// 例外処理の結果（入口スタブがどう復帰するか）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 解決済み。faulting 命令を再実行する
    Resolved,
    /// resumable_call の中で起きた fault。呼び出しを打ち切って復帰する
    ResumeAfterFault,
    /// COW コピー先が取れなかった。faulting プロセスだけを終了させる
    OutOfMemory { vaddr: VirtAddr },
}

pub type FaultHandler = fn(&mut FaultFrame) -> FaultOutcome;

/// 例外ハンドラの登録先
pub trait FaultRegistry {
    fn set_fault_handler(&mut self, kind: FaultKind, handler: FaultHandler);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: &'static str,
    pub offset: u32,
}

/// 致命時の報告先
pub trait Diagnostics {
    fn in_panic(&self) -> bool;
    /// addr を含むシンボル（分からなければ None）。内部で fault してもよい
    fn resolve_symbol(&self, addr: u32) -> Option<Symbol>;
    fn fatal(&self, report: &FaultReport) -> !;
    fn halt_forever(&self, msg: &str) -> !;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReport {
    PageFault {
        write: bool,
        vaddr: VirtAddr,
        present: bool,
        user: bool,
        eip: u32,
        symbol: Option<Symbol>,
    },
    GeneralProtection {
        error_code: u32,
    },
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FaultReport::PageFault {
                write,
                vaddr,
                present,
                user,
                eip,
                symbol,
            } => {
                write!(
                    f,
                    "PAGE FAULT in attempt to {} {:#010x} from {}{}\n",
                    if write { "WRITE" } else { "READ" },
                    vaddr.0,
                    if user { "userland" } else { "kernel" },
                    if present { "" } else { " (NON present)" },
                )?;

                if user {
                    return write!(f, "EIP: {:#010x}\n", eip);
                }

                match symbol {
                    Some(s) => write!(f, "EIP: {:#010x} [{} + {:#x}]\n", eip, s.name, s.offset),
                    None => write!(f, "EIP: {:#010x} [??? + 0x0]\n", eip),
                }
            }
            FaultReport::GeneralProtection { error_code } => {
                write!(f, "General protection fault. Error: {:#010x}\n", error_code)
            }
        }
    }
}

/// #PF / #GP の判断ロジック。状態は resumable_call のガードだけ。
pub struct FaultDispatcher {
    resumable: AtomicBool,
    faulted_in_resumable: AtomicBool,
}

impl FaultDispatcher {
    pub const fn new() -> Self {
        FaultDispatcher {
            resumable: AtomicBool::new(false),
            faulted_in_resumable: AtomicBool::new(false),
        }
    }

    /// f をガード付きで実行する。途中で fault が起きたら None。
    pub fn resumable_call<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        self.faulted_in_resumable.store(false, Ordering::SeqCst);
        self.resumable.store(true, Ordering::SeqCst);

        let r = f();

        self.resumable.store(false, Ordering::SeqCst);
        if self.faulted_in_resumable.swap(false, Ordering::SeqCst) {
            None
        } else {
            Some(r)
        }
    }

    /// resumable_call の最中なら fault を記録して true。
    /// 例外入口は他の状態に触る前にこれを見る（外側の処理が借用中のものに再入しない）。
    pub fn claim_resumable_fault(&self) -> bool {
        if !self.resumable.load(Ordering::SeqCst) {
            return false;
        }
        self.faulted_in_resumable.store(true, Ordering::SeqCst);
        true
    }

    /// #PF 本体。resolve_cow は現在のアドレス空間で COW を解決する。
    pub fn on_page_fault<C, D, F>(&self, frame: &FaultFrame, cpu: &C, diag: &D, resolve_cow: F) -> FaultOutcome
    where
        C: Cpu,
        D: Diagnostics,
        F: FnOnce(VirtAddr) -> Result<CowOutcome, VmError>,
    {
        if self.claim_resumable_fault() {
            return FaultOutcome::ResumeAfterFault;
        }

        if diag.in_panic() {
            diag.halt_forever("Page fault while already in panic state.");
        }

        assert!(!cpu.preemption_enabled(), "page fault entered with preemption enabled");
        assert!(!cpu.interrupts_enabled(), "page fault entered with interrupts enabled");

        let vaddr = cpu.fault_address();
        let code = PageFaultErrorCode::from_bits_truncate(frame.error_code as u64);
        let write = code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
        let present = code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
        let user = code.contains(PageFaultErrorCode::USER_MODE);

        cpu.enable_interrupts();
        let cow = if write && present {
            resolve_cow(vaddr)
        } else {
            Ok(CowOutcome::NotCow)
        };
        cpu.disable_interrupts();

        match cow {
            Ok(outcome) if outcome.is_handled() => return FaultOutcome::Resolved,
            Ok(_) => {}
            Err(VmError::OutOfMemory) => return FaultOutcome::OutOfMemory { vaddr },
        }

        // user の fault にはシンボルを付けない（kernel のシンボル表と無関係）
        let symbol = if user {
            None
        } else {
            self.resumable_call(|| diag.resolve_symbol(frame.eip)).flatten()
        };

        diag.fatal(&FaultReport::PageFault {
            write,
            vaddr,
            present,
            user,
            eip: frame.eip,
            symbol,
        })
    }

    /// #GP は常に致命（原因の区別やシグナル配送はしない）
    pub fn on_general_protection_fault<D: Diagnostics>(&self, frame: &FaultFrame, diag: &D) -> ! {
        diag.fatal(&FaultReport::GeneralProtection {
            error_code: frame.error_code,
        })
    }
}

impl Default for FaultDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
