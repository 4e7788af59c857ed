// kernel/src/mem/cow.rs
//
// 役割:
// - 書き込み保護違反が COW ページへの書き込みだったときに、それを解消する。
//
// やること:
// - COW_ORIGINAL_WRITABLE が立っていなければ「COW ではない」と返す（呼び出し側が fatal にする）。
// - 参照カウントが 1 なら、コピーせずにその場で writable に戻す。
// - 2 以上なら、新しいフレームへ中身をコピーし、PTE を付け替える。
//
// やらないこと:
// - fault の種別判定・割り込み状態の管理（kernel::fault 側）
//
// 設計方針:
// - 中身のコピーは物理窓越しにフレーム→フレームで行う。PTE の付け替えはコピー後。
//   なので PTE が未初期化フレームを指す瞬間は無い。
// - コピー先が取れない場合は PTE も参照カウントも触らずに OutOfMemory を返す。

use crate::arch::paging::Mmu;
use crate::kernel::trace::{trace_cow, CowTraceEvent};
use crate::mem::addr::{PhysFrame, VirtAddr};
use crate::mem::address_space::{VmError, Vmm};
use crate::mem::paging::PageFlags;
use crate::mm::FrameAllocator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CowOutcome {
    /// COW ページではない（または 4KiB マッピングが無い）
    NotCow,
    /// 唯一の所有者だったので、コピーせず writable に戻した
    MadeWritable,
    /// 共有されていたので from → to にコピーして付け替えた
    Copied { from: PhysFrame, to: PhysFrame },
}

impl CowOutcome {
    pub fn is_handled(self) -> bool {
        !matches!(self, CowOutcome::NotCow)
    }
}

impl<A: FrameAllocator, M: Mmu> Vmm<A, M> {
    /// 現在の page directory で vaddr への書き込みを COW として解決する。
    pub fn resolve_cow(&mut self, vaddr: VirtAddr) -> Result<CowOutcome, VmError> {
        let page = vaddr.align_down();

        // Safety: current は有効な page directory。pte はこの関数の中でだけ使う
        let pte = unsafe { self.pte_mut(self.current_root(), page) };
        let Some(pte) = pte.filter(|e| e.is_present() && e.is_cow()) else {
            trace_cow(CowTraceEvent::NotCow);
            return Ok(CowOutcome::NotCow);
        };

        let shared = pte.frame();
        let shared_paddr = shared.start_address();

        let mut flags = pte.flags();
        flags.remove(PageFlags::COW_ORIGINAL_WRITABLE);
        flags.insert(PageFlags::WRITABLE);

        // 参照 1 = 自分だけ。管理外フレーム（MMIO など）もコピーはしない。
        let refs = self.refcounts().get(shared_paddr);
        if refs == 1 || !self.refcounts().tracks(shared_paddr) {
            pte.set_flags(flags);
            self.mmu_mut().invalidate_page(page);
            trace_cow(CowTraceEvent::MadeWritable);
            return Ok(CowOutcome::MadeWritable);
        }

        let Some(copy) = self.frames_mut().allocate_frame() else {
            crate::logging::error("vm: resolve_cow: no frame for private copy");
            return Err(VmError::OutOfMemory);
        };
        assert_eq!(
            self.refcounts().get(copy.start_address()),
            0,
            "resolve_cow: fresh frame is still referenced"
        );

        // Safety: shared / copy はどちらも窓の中の別フレーム
        unsafe { self.window().copy_frame(shared, copy) };

        self.refcounts_mut().decrement(shared_paddr);
        self.refcounts_mut().increment(copy.start_address());

        pte.set_frame(copy);
        pte.set_flags(flags);
        self.mmu_mut().invalidate_page(page);

        trace_cow(CowTraceEvent::Copied);
        Ok(CowOutcome::Copied {
            from: shared,
            to: copy,
        })
    }
}
