// src/kernel/mod.rs
//
// 仮想メモリサブシステムの組み立てと起動手順。
//
// - KernelVm: Vmm（ページングコア）+ Cpu + Diagnostics をまとめたもの。
//   例外入口からは state_ref 経由でだけ触られる。
// - FAULTS: resumable_call のガード。KernelVm の外に置き、例外入口は
//   KernelVm を借用する前にこれを見る（報告中の入れ子 fault が再入しない）。
// - init_paging: kernel linear map を張り、kernel directory を載せ、#PF / #GP を登録する。
// - init_paging_cow: 参照カウント表を確保し、全アドレス空間共通の
//   トランポリンページ（USER_VDSO_VADDR）を kernel directory に張る。
//
// [起動順序]
//
// 0. logging::init（kernel image 側で最初に呼ぶ）
// 1. KernelVm::new（kernel directory は固定領域。アロケータを使わない）
// 2. init_paging（ここで KernelVm は state_ref に登録され、以後は with_kernel_vm 経由）
// 3. init_paging_cow（失敗したら起動できないので panic）

pub mod state_ref;
pub mod trace;

use crate::arch::cpu::{self, Cpu};
use crate::arch::interrupts::{
    Diagnostics, FaultDispatcher, FaultFrame, FaultKind, FaultOutcome, FaultRegistry,
};
use crate::arch::paging::Mmu;
use crate::logging;
use crate::mem::addr::{PhysFrame, VirtAddr};
use crate::mem::address_space::Vmm;
use crate::mem::layout::USER_VDSO_VADDR;
use crate::mm::{FrameAllocator, PhysWindow};

pub struct KernelVm<A, M, C, D>
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
{
    pub vmm: Vmm<A, M>,
    cpu: C,
    diag: D,
}

static FAULTS: FaultDispatcher = FaultDispatcher::new();

/// 例外入口と共有する resumable_call のガード
pub fn fault_dispatcher() -> &'static FaultDispatcher {
    &FAULTS
}

/// 実機（i386 bare metal）での具体型
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub type BootKernelVm = KernelVm<
    crate::mm::PoolFrameAllocator<'static>,
    crate::arch::paging::X86Mmu,
    crate::arch::cpu::X86Cpu,
    crate::panic::EmergencyDiagnostics,
>;

impl<A, M, C, D> KernelVm<A, M, C, D>
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
{
    pub fn new(
        window: PhysWindow,
        frames: A,
        mmu: M,
        kernel_dir_frame: PhysFrame,
        cpu: C,
        diag: D,
    ) -> Self {
        KernelVm {
            vmm: Vmm::new(window, frames, mmu, kernel_dir_frame),
            cpu,
            diag,
        }
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn diag(&self) -> &D {
        &self.diag
    }

    /// #PF: 現在のアドレス空間で COW を試み、だめなら致命報告。
    pub fn handle_page_fault(&mut self, frame: &FaultFrame) -> FaultOutcome {
        let KernelVm { vmm, cpu, diag } = self;

        let outcome = FAULTS.on_page_fault(frame, &*cpu, &*diag, |vaddr| vmm.resolve_cow(vaddr));

        if let FaultOutcome::OutOfMemory { vaddr } = outcome {
            logging::error("vm: out of memory while resolving a copy-on-write fault");
            logging::info_u64(" vaddr", vaddr.0 as u64);
        }
        outcome
    }

    pub fn handle_general_protection_fault(&mut self, frame: &FaultFrame) -> ! {
        FAULTS.on_general_protection_fault(frame, &self.diag)
    }

    /// 参照カウント表とトランポリンページの準備。どちらか失敗したら起動を続けられない。
    pub fn init_paging_cow(&mut self, phys_mem_size: u64, vdso_frame: PhysFrame) {
        if self.vmm.init_refcounts(phys_mem_size).is_err() {
            panic!("init_paging_cow: unable to allocate the frame refcount table");
        }

        // user から読めるが書けない。kernel 側 PDE なので clone で全員に引き継がれる。
        let mapped = self.vmm.map_kernel_page(
            VirtAddr(USER_VDSO_VADDR),
            vdso_frame.start_address(),
            true,
            false,
        );
        if mapped.is_err() {
            panic!("init_paging_cow: unable to map the vdso-like page");
        }

        logging::info("vm: copy-on-write ready");
    }
}

/// kernel linear map を張って kernel directory に切り替え、例外ハンドラを登録する。
///
/// phys_limit: linear map で覆う物理メモリの上限（バイト）
pub fn init_paging<A, M, C, D, R>(kvm: &'static mut KernelVm<A, M, C, D>, registry: &mut R, phys_limit: u64)
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
    R: FaultRegistry,
{
    kvm.vmm.map_kernel_linear(phys_limit);
    kvm.vmm.switch_to_kernel_dir();

    state_ref::register_kernel_vm(kvm);

    registry.set_fault_handler(FaultKind::PageFault, page_fault_entry::<A, M, C, D>);
    registry.set_fault_handler(FaultKind::GeneralProtection, general_protection_entry::<A, M, C, D>);

    logging::info("vm: paging initialized");
}

fn page_fault_entry<A, M, C, D>(frame: &mut FaultFrame) -> FaultOutcome
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
{
    // シンボル解決中の fault では KernelVm は外側が借用したまま
    if FAULTS.claim_resumable_fault() {
        return FaultOutcome::ResumeAfterFault;
    }

    let frame = *frame;
    let _preempt = cpu::PreemptionDisabled::new();
    match state_ref::with_kernel_vm::<A, M, C, D, _, _>(|kvm| kvm.handle_page_fault(&frame)) {
        Some(outcome) => outcome,
        None => panic!("page fault before init_paging"),
    }
}

fn general_protection_entry<A, M, C, D>(frame: &mut FaultFrame) -> FaultOutcome
where
    A: FrameAllocator,
    M: Mmu,
    C: Cpu,
    D: Diagnostics,
{
    let frame = *frame;
    state_ref::with_kernel_vm::<A, M, C, D, (), _>(|kvm| kvm.handle_general_protection_fault(&frame));
    panic!("general protection fault before init_paging (error {:#x})", frame.error_code)
}
