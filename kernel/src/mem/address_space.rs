// kernel/src/mem/address_space.rs
//
// 役割:
// - アドレス空間（page directory 1 枚を root とする 2 段テーブル）を操作する。
// - map / unmap / 問い合わせ / COW clone / destroy / CR3 切替。
//
// やること:
// - PTE を張る・剥がすたびに、フレーム参照カウントを対で増減する。
// - kernel 側 PDE（768..1024）は clone 時に値コピーし、page table を共有する。
// - user 側 PDE は clone 時に page table を深くコピーし、指す先のフレームは
//   read-only + COW_ORIGINAL_WRITABLE で共有する。
//
// やらないこと:
// - 排他制御（呼び出し側が割り込み禁止で呼ぶ前提）
// - linear map 範囲の仮想→物理変換（layout::kernel_va_to_pa で足りる）
//
// 設計方針:
// - ハードウェア・アロケータは Mmu / FrameAllocator / PhysWindow 越しにだけ触る。
//   これでホスト上のテストから同じコードを動かせる。
// - 二重 map / 存在しない entry の unmap などはプログラミングエラーとして assert。
// - 回復可能なのはメモリ不足（VmError::OutOfMemory）だけ。

use core::fmt;

use alloc::collections::TryReserveError;
use alloc::vec;

use crate::arch::paging::Mmu;
use crate::kernel::trace::{trace_cow, CowTraceEvent};
use crate::logging;
use crate::mem::addr::{PhysAddr, PhysFrame, VirtAddr, ENTRIES_PER_TABLE, LARGE_PAGE_SIZE, PAGE_SIZE};
use crate::mem::layout::{is_linear_mapped, KERNEL_BASE_VA, KERNEL_PDE_START, LINEAR_MAPPING_SIZE};
use crate::mem::paging::{PageDirEntry, PageDirectory, PageFlags, PageTable, PageTableEntry};
use crate::mem::refcount::FrameRefTable;
use crate::mm::pagetable_init::allocate_zeroed_table;
use crate::mm::{FrameAllocator, PhysWindow};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// page table / page directory / COW コピー先のフレームが取れなかった
    OutOfMemory,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// page directory のハンドル（所有権付き）。
///
/// Clone / Copy を持たないので、destroy(dir) した後に同じ dir を使うことは
/// 型の上でできない。
#[derive(Debug, PartialEq, Eq)]
pub struct PageDir {
    root: PhysFrame,
}

impl PageDir {
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn root_paddr(&self) -> PhysAddr {
        self.root.start_address()
    }
}

/// 仮想メモリマネージャ。
///
/// - kernel_dir: 起動時に一度だけ作られ、破棄されない。
/// - current: いま CR3 に載っている directory の root（fault path が参照する）。
pub struct Vmm<A: FrameAllocator, M: Mmu> {
    window: PhysWindow,
    frames: A,
    mmu: M,
    refcounts: FrameRefTable,
    kernel_dir: PageDir,
    current: PhysFrame,
}

impl<A: FrameAllocator, M: Mmu> Vmm<A, M> {
    /// kernel_dir_frame を kernel page directory として使う Vmm を作る。
    ///
    /// kernel_dir_frame は固定確保された領域（アロケータ外）で、ここでゼロ初期化する。
    /// CR3 はまだ切り替えない（switch_to_kernel_dir で行う）。
    pub fn new(window: PhysWindow, frames: A, mmu: M, kernel_dir_frame: PhysFrame) -> Self {
        // Safety: kernel_dir_frame は window 内にあり、まだ誰も参照していない
        unsafe { window.zero_frame(kernel_dir_frame) };

        Vmm {
            window,
            frames,
            mmu,
            refcounts: FrameRefTable::empty(),
            kernel_dir: PageDir {
                root: kernel_dir_frame,
            },
            current: kernel_dir_frame,
        }
    }

    // ─────────────────────────────────────────────
    // テーブルへの生アクセス（window 経由）
    // ─────────────────────────────────────────────

    /// # Safety
    /// - root は page directory として使われているフレームであること。
    /// - 返した参照が生きている間、同じフレームへの別の参照を作らないこと。
    pub(crate) unsafe fn pd<'a>(&self, root: PhysFrame) -> &'a mut PageDirectory {
        self.window.frame_mut(root)
    }

    /// # Safety
    /// - frame は page table として使われているフレームであること。
    pub(crate) unsafe fn pt<'a>(&self, frame: PhysFrame) -> &'a mut PageTable {
        self.window.frame_mut(frame)
    }

    /// vaddr を指す PTE（4KiB マッピング）への参照。PDE が無い / superpage なら None。
    ///
    /// # Safety
    /// - pd() と同じ。
    pub(crate) unsafe fn pte_mut<'a>(&self, root: PhysFrame, vaddr: VirtAddr) -> Option<&'a mut PageTableEntry> {
        let pde = self.pd(root)[vaddr.pd_index()];
        if !pde.is_present() || pde.is_large() {
            return None;
        }
        Some(&mut self.pt(pde.table_frame())[vaddr.pt_index()])
    }

    // ─────────────────────────────────────────────
    // 問い合わせ
    // ─────────────────────────────────────────────

    pub fn is_mapped(&self, dir: &PageDir, vaddr: VirtAddr) -> bool {
        let pde = unsafe { self.pd(dir.root) }[vaddr.pd_index()];
        if !pde.is_present() {
            return false;
        }
        if pde.is_large() {
            return true;
        }
        let pt = unsafe { self.pt(pde.table_frame()) };
        pt[vaddr.pt_index()].is_present()
    }

    /// vaddr がマップされている物理フレームの先頭アドレス。
    ///
    /// linear map 範囲は対象外（layout::kernel_va_to_pa を使う）。
    pub fn get_mapping(&self, dir: &PageDir, vaddr: VirtAddr) -> PhysAddr {
        assert!(
            !is_linear_mapped(vaddr),
            "get_mapping on the kernel linear map"
        );

        let pde = unsafe { self.pd(dir.root) }[vaddr.pd_index()];
        assert!(pde.is_present(), "get_mapping: no page table");

        if pde.is_large() {
            return PhysAddr(pde.large_base().0 | (vaddr.align_down().0 & (LARGE_PAGE_SIZE - 1)));
        }

        let pte = unsafe { self.pt(pde.table_frame()) }[vaddr.pt_index()];
        assert!(pte.is_present(), "get_mapping: page not present");
        pte.frame().start_address()
    }

    /// vaddr の PTE のコピー（4KiB マッピングが無ければ None）
    pub fn lookup_entry(&self, dir: &PageDir, vaddr: VirtAddr) -> Option<PageTableEntry> {
        unsafe { self.pte_mut(dir.root, vaddr) }
            .map(|e| *e)
            .filter(|e| e.is_present())
    }

    pub fn ref_count(&self, paddr: PhysAddr) -> u16 {
        self.refcounts.get(paddr)
    }

    // ─────────────────────────────────────────────
    // map / unmap
    // ─────────────────────────────────────────────

    /// 4KiB ページを 1 枚マップする。
    ///
    /// page table が無ければゼロ初期化して作る。作れなければ何も変えずに OutOfMemory。
    pub fn map(
        &mut self,
        dir: &PageDir,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        user: bool,
        writable: bool,
    ) -> Result<(), VmError> {
        self.map_in(dir.root, vaddr, paddr, user, writable)
    }

    fn map_in(
        &mut self,
        root: PhysFrame,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        user: bool,
        writable: bool,
    ) -> Result<(), VmError> {
        assert!(vaddr.is_page_aligned(), "map: vaddr is not page-aligned");
        assert!(paddr.is_page_aligned(), "map: paddr is not page-aligned");
        self.assert_not_private_kernel_range(root, vaddr);

        let pd = unsafe { self.pd(root) };
        let pde = &mut pd[vaddr.pd_index()];
        assert!(!pde.is_large(), "map: inside a 4MiB mapping");

        if !pde.is_present() {
            let table = allocate_zeroed_table(&mut self.frames, &self.window)
                .ok_or(VmError::OutOfMemory)?;

            let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
            if user {
                flags |= PageFlags::USER;
            }
            *pde = PageDirEntry::table(table, flags);
        } else if user && !pde.flags().contains(PageFlags::USER) {
            // 既存の kernel 用 page table に user ページを足す場合、PDE 側も開ける
            *pde = PageDirEntry::table(pde.table_frame(), pde.flags() | PageFlags::USER);
        }

        let pte = &mut unsafe { self.pt(pde.table_frame()) }[vaddr.pt_index()];
        assert!(!pte.is_present(), "map: page already mapped");

        let mut flags = PageFlags::PRESENT;
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        if user {
            flags |= PageFlags::USER;
        } else {
            flags |= PageFlags::GLOBAL;
        }
        *pte = PageTableEntry::new(paddr.frame(), flags);

        self.refcounts.increment(paddr);
        self.mmu.invalidate_page(vaddr);
        Ok(())
    }

    /// kernel 側（PDE 768..）は kernel directory の page table を全員で共有する。
    /// プロセスの directory 越しに張ると、そのプロセスだけの PDE ができて
    /// destroy でも回収されないので禁止（map_kernel_page を使う）。
    fn assert_not_private_kernel_range(&self, root: PhysFrame, vaddr: VirtAddr) {
        assert!(
            root == self.kernel_dir.root || vaddr.pd_index() < KERNEL_PDE_START,
            "map: kernel range through a process page directory"
        );
    }

    /// kernel page directory に 4KiB ページを 1 枚マップする。
    ///
    /// kernel 側 PDE に張った page table は、以後 clone される全 directory と共有される。
    pub fn map_kernel_page(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        user: bool,
        writable: bool,
    ) -> Result<(), VmError> {
        let root = self.kernel_dir.root;
        self.map_in(root, vaddr, paddr, user, writable)
    }

    /// 連続する count ページをマップする。途中で失敗したら、それまでの分を外して返す。
    pub fn map_pages(
        &mut self,
        dir: &PageDir,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        user: bool,
        writable: bool,
    ) -> Result<(), VmError> {
        for i in 0..count {
            let off = (i as u32) * PAGE_SIZE;
            if let Err(e) = self.map_in(dir.root, VirtAddr(vaddr.0 + off), PhysAddr(paddr.0 + off), user, writable) {
                self.unmap_pages(dir, vaddr, i);
                return Err(e);
            }
        }
        Ok(())
    }

    /// PTE を外し、フレームの参照カウントを 1 減らす。減らした後の値を返す。
    ///
    /// フレーム自体は解放しない（0 になったかどうかは呼び出し側が判断する）。
    pub fn unmap(&mut self, dir: &PageDir, vaddr: VirtAddr) -> u16 {
        let pte = unsafe { self.pte_mut(dir.root, vaddr) }.filter(|e| e.is_present());
        let Some(pte) = pte else {
            panic!("unmap: page not mapped");
        };

        let paddr = pte.frame().start_address();
        pte.clear();

        let remaining = self.refcounts.decrement(paddr);
        self.mmu.invalidate_page(vaddr);
        remaining
    }

    pub fn unmap_pages(&mut self, dir: &PageDir, vaddr: VirtAddr, count: usize) {
        for i in 0..count {
            self.unmap(dir, VirtAddr(vaddr.0 + (i as u32) * PAGE_SIZE));
        }
    }

    /// マップ済みページの書き込み可否を切り替える（参照カウントは変えない）
    pub fn set_page_rw(&mut self, dir: &PageDir, vaddr: VirtAddr, writable: bool) {
        let pte = unsafe { self.pte_mut(dir.root, vaddr) }.filter(|e| e.is_present());
        let Some(pte) = pte else {
            panic!("set_page_rw: page not mapped");
        };

        let mut flags = pte.flags();
        flags.set(PageFlags::WRITABLE, writable);
        pte.set_flags(flags);

        self.mmu.invalidate_page(vaddr);
    }

    /// 4MiB superpage を 1 枚張る（page table は作らない）
    pub fn map_4mb(&mut self, dir: &PageDir, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) {
        self.map_4mb_in(dir.root, vaddr, paddr, flags);
    }

    fn map_4mb_in(&mut self, root: PhysFrame, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) {
        assert!(vaddr.is_large_page_aligned(), "map_4mb: vaddr is not 4MiB-aligned");
        assert!(paddr.is_large_page_aligned(), "map_4mb: paddr is not 4MiB-aligned");
        self.assert_not_private_kernel_range(root, vaddr);

        let pde = &mut unsafe { self.pd(root) }[vaddr.pd_index()];
        assert!(pde.raw() == 0, "map_4mb: directory entry already in use");

        *pde = PageDirEntry::large(paddr, flags | PageFlags::PRESENT);
    }

    /// kernel linear map（KERNEL_BASE_VA + pa → pa）を 4MiB global superpage で張る。
    ///
    /// 範囲は min(phys_limit を 4MiB 単位に切り上げたもの, LINEAR_MAPPING_SIZE)。
    pub fn map_kernel_linear(&mut self, phys_limit: u64) {
        let large = LARGE_PAGE_SIZE as u64;
        let size = ((phys_limit + large - 1) & !(large - 1)).min(LINEAR_MAPPING_SIZE as u64);

        self.mmu.enable_large_pages();

        let root = self.kernel_dir.root;
        let mut pa = 0u64;
        while pa < size {
            self.map_4mb_in(
                root,
                VirtAddr(KERNEL_BASE_VA + pa as u32),
                PhysAddr(pa as u32),
                PageFlags::WRITABLE | PageFlags::GLOBAL,
            );
            pa += large;
        }

        logging::info_u64("vm: kernel linear map bytes", size);
    }

    // ─────────────────────────────────────────────
    // clone / destroy
    // ─────────────────────────────────────────────

    /// dir の COW スナップショットを作る。
    ///
    /// - kernel 側 PDE は値コピー（page table 共有）
    /// - user 側の present PTE は read-only 化し、元が writable なら
    ///   COW_ORIGINAL_WRITABLE を立て、フレームの参照カウントを +1
    /// - user 側 page table は新しいフレームに 1024 entry まるごとコピー
    ///
    /// 途中でメモリが尽きたら、作りかけの directory を destroy して
    /// 参照カウントを clone 前の値に戻してから OutOfMemory を返す。
    pub fn clone_dir(&mut self, dir: &PageDir) -> Result<PageDir, VmError> {
        self.clone_root(dir.root)
    }

    /// kernel directory を雛形に、新しい（user 側が空の）アドレス空間を作る。
    pub fn clone_kernel_dir(&mut self) -> Result<PageDir, VmError> {
        let root = self.kernel_dir.root;
        self.clone_root(root)
    }

    fn clone_root(&mut self, src_root: PhysFrame) -> Result<PageDir, VmError> {
        let new_root = allocate_zeroed_table(&mut self.frames, &self.window).ok_or_else(|| {
            logging::error("vm: clone_dir: no frame for page directory");
            VmError::OutOfMemory
        })?;
        let new_dir = PageDir { root: new_root };

        let src = unsafe { self.pd(src_root) };
        let dst = unsafe { self.pd(new_root) };

        for i in KERNEL_PDE_START..ENTRIES_PER_TABLE {
            dst[i] = src[i];
        }

        let mut result = Ok(());

        for i in 0..KERNEL_PDE_START {
            let pde = src[i];
            if !pde.is_present() {
                continue;
            }
            assert!(!pde.is_large(), "clone_dir: 4MiB mapping in the user range");

            // 先に複製先の page table を確保する（失敗時にこの PDE の PTE は未変更）
            let Some(new_table) = self.frames.allocate_frame() else {
                logging::error("vm: clone_dir: no frame for page table");
                result = Err(VmError::OutOfMemory);
                break;
            };

            let table = unsafe { self.pt(pde.table_frame()) };
            for pte in table.iter_mut() {
                if !pte.is_present() {
                    continue;
                }

                let mut flags = pte.flags();
                if flags.contains(PageFlags::WRITABLE) {
                    flags.remove(PageFlags::WRITABLE);
                    flags.insert(PageFlags::COW_ORIGINAL_WRITABLE);
                    pte.set_flags(flags);
                }

                self.refcounts.increment(pte.frame().start_address());
            }

            // Safety: 両方ともこの Vmm が管理する別々のフレーム
            unsafe { self.window.copy_frame(pde.table_frame(), new_table) };

            let mut new_pde = pde;
            new_pde.set_table_frame(new_table);
            dst[i] = new_pde;
        }

        // 元の directory の writable な TLB entry を残さない
        if src_root == self.current {
            self.mmu.flush_all();
        }

        if let Err(e) = result {
            self.destroy(new_dir);
            return Err(e);
        }

        trace_cow(CowTraceEvent::Clone);
        Ok(new_dir)
    }

    /// user 側のマッピングをすべて外し、page table と directory を解放する。
    ///
    /// 解放順: データフレーム（参照 0 になったもの）→ page table → directory。
    pub fn destroy(&mut self, dir: PageDir) {
        assert!(dir.root != self.kernel_dir.root, "destroy: kernel page directory");
        assert!(dir.root != self.current, "destroy: page directory is active");

        let pd = unsafe { self.pd(dir.root) };

        for i in 0..KERNEL_PDE_START {
            let pde = pd[i];
            if !pde.is_present() {
                continue;
            }
            assert!(!pde.is_large(), "destroy: 4MiB mapping in the user range");

            let table = unsafe { self.pt(pde.table_frame()) };
            for pte in table.iter() {
                if !pte.is_present() {
                    continue;
                }

                let paddr = pte.frame().start_address();
                // 管理外フレーム（MMIO など）は解放しない
                if self.refcounts.tracks(paddr) && self.refcounts.decrement(paddr) == 0 {
                    self.frames.free_frame(pte.frame());
                }
            }

            self.frames.free_frame(pde.table_frame());
        }

        self.frames.free_frame(dir.root);
        trace_cow(CowTraceEvent::Destroy);
    }

    // ─────────────────────────────────────────────
    // CR3
    // ─────────────────────────────────────────────

    pub fn set_page_directory(&mut self, dir: &PageDir) {
        self.current = dir.root;
        self.mmu.load_root(dir.root.start_address());
    }

    pub fn switch_to_kernel_dir(&mut self) {
        self.current = self.kernel_dir.root;
        self.mmu.load_root(self.kernel_dir.root.start_address());
    }

    pub fn current_root(&self) -> PhysFrame {
        self.current
    }

    pub fn is_current(&self, dir: &PageDir) -> bool {
        dir.root == self.current
    }

    pub fn kernel_dir(&self) -> &PageDir {
        &self.kernel_dir
    }

    // ─────────────────────────────────────────────
    // 参照カウント表
    // ─────────────────────────────────────────────

    /// 物理メモリ phys_mem_size バイトぶんの参照カウント表を確保して差し替える。
    pub fn init_refcounts(&mut self, phys_mem_size: u64) -> Result<(), TryReserveError> {
        self.refcounts = FrameRefTable::for_phys_mem(phys_mem_size)?;
        logging::info_u64("vm: refcount table frames", self.refcounts.frame_count() as u64);
        Ok(())
    }

    pub fn refcounts(&self) -> &FrameRefTable {
        &self.refcounts
    }

    pub(crate) fn refcounts_mut(&mut self) -> &mut FrameRefTable {
        &mut self.refcounts
    }

    /// 参照カウント表と実際のマッピングの整合をチェックする。
    ///
    /// dirs は kernel directory 以外の生きている directory すべて。
    /// kernel 側（共有）page table は kernel directory から 1 回だけ数える。
    /// 食い違ったフレームの数を返す。
    pub fn check_refcounts(&self, dirs: &[&PageDir]) -> usize {
        let mut expected = vec![0u32; self.refcounts.frame_count()];

        let mut count_range = |root: PhysFrame, pdes: core::ops::Range<usize>| {
            let pd = unsafe { self.pd(root) };
            for i in pdes {
                let pde = pd[i];
                if !pde.is_present() || pde.is_large() {
                    continue;
                }
                for pte in unsafe { self.pt(pde.table_frame()) }.iter() {
                    let paddr = pte.frame().start_address();
                    if pte.is_present() && self.refcounts.tracks(paddr) {
                        expected[pte.frame().number as usize] += 1;
                    }
                }
            }
        };

        count_range(self.kernel_dir.root, 0..ENTRIES_PER_TABLE);
        for dir in dirs.iter().filter(|d| d.root != self.kernel_dir.root) {
            count_range(dir.root, 0..KERNEL_PDE_START);
        }

        let mut violations = 0;
        for (i, &want) in expected.iter().enumerate() {
            let paddr = PhysFrame::from_index(i as u32).start_address();
            let have = self.refcounts.get(paddr);
            if u32::from(have) != want {
                logging::error("INVARIANT VIOLATION: frame refcount does not match live mappings");
                logging::info_u64(" frame_paddr", paddr.0 as u64);
                logging::info_u64(" recorded", have as u64);
                logging::info_u64(" expected", want as u64);
                violations += 1;
            }
        }
        violations
    }

    // ─────────────────────────────────────────────
    // 部品へのアクセス
    // ─────────────────────────────────────────────

    pub fn window(&self) -> &PhysWindow {
        &self.window
    }

    pub fn frames(&self) -> &A {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub(crate) fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }
}
