// kernel/src/kernel/state_ref.rs
//
// 役割:
// - 例外入口（登録された fn ポインタ）から KernelVm にアクセスするための “唯一の入口” を提供する。
//
// やること:
// - KernelVm の raw pointer(アドレス) を登録する。
// - 呼び出し側は with_kernel_vm() 経由でのみ &mut KernelVm を得る。
//
// やらないこと:
// - 複雑な同期（単一コア前提・割り込み中の短時間利用のみ）
// - 型の検査（登録と参照は init_paging が同じ型引数で行う）

use core::sync::atomic::{AtomicUsize, Ordering};

use super::KernelVm;
use crate::arch::cpu::Cpu;
use crate::arch::interrupts::Diagnostics;
use crate::arch::paging::Mmu;
use crate::mm::FrameAllocator;

// 0 なら未登録
static KERNEL_VM_ADDR: AtomicUsize = AtomicUsize::new(0);

/// KernelVm を登録する（init_paging から呼ぶ）。'static なので登録後に消えることはない。
pub fn register_kernel_vm<A, M, C, D>(kvm: &'static mut KernelVm<A, M, C, D>)
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
{
    let addr = kvm as *mut KernelVm<A, M, C, D> as usize;
    KERNEL_VM_ADDR.store(addr, Ordering::SeqCst);
}

/// KernelVm を一時的に借用して処理する。未登録なら None。
pub fn with_kernel_vm<A, M, C, D, R, F>(f: F) -> Option<R>
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
    F: FnOnce(&mut KernelVm<A, M, C, D>) -> R,
{
    let addr = KERNEL_VM_ADDR.load(Ordering::SeqCst);
    if addr == 0 {
        return None;
    }

    let p = addr as *mut KernelVm<A, M, C, D>;

    // Safety:
    // - 登録されるのは 'static な KernelVm だけ
    // - 割り込み禁止中（または fault 解決中）の短時間利用に限定
    Some(unsafe { f(&mut *p) })
}
