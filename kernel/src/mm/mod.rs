// src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - FrameAllocator: ページングコアが page table / page directory / COW コピー先を
//   取るための最小インターフェース（失敗しうる。待たない）。
// - PhysWindow: 物理フレームを kernel から読み書きするための線形窓。
//   すべての物理メモリアクセスは phys_to_virt() を経由させる。
// - PoolFrameAllocator: memory map の Usable 領域を先頭から順に返し（位置は
//   region index + cursor で覚える）、解放されたフレームは free list で再利用する具体実装。
// - unsafe は「窓を通した生ポインタ化」の箇所に局所化する。

pub mod pagetable_init;

use crate::mem::addr::{PhysAddr, PhysFrame, PAGE_SIZE};
use crate::types::{MemoryRegion, MemoryRegionType};

/// ページングコアが使うフレームアロケータ。
///
/// - 返すフレームは 4KiB 境界。中身は未初期化でよい。
/// - 確保できなければ None（呼び出し側は OutOfMemory として扱う）。
pub trait FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
    fn free_frame(&mut self, frame: PhysFrame);
}

/// 物理メモリ窓: 物理アドレス + offset = kernel から見える仮想アドレス。
///
/// 実機では offset = KERNEL_BASE_VA（linear map）。
/// ホスト上のテストではバッファ先頭と物理ベースの差を offset にする。
#[derive(Clone, Copy, Debug)]
pub struct PhysWindow {
    offset: usize,
}

impl PhysWindow {
    /// # Safety
    /// - 管理対象の全フレームについて `offset + paddr` が読み書き可能であること。
    pub const unsafe fn new(offset: usize) -> Self {
        PhysWindow { offset }
    }

    /// 物理アドレス → 窓の中のポインタ
    pub fn phys_to_virt(&self, paddr: PhysAddr) -> *mut u8 {
        self.offset.wrapping_add(paddr.0 as usize) as *mut u8
    }

    /// フレームを `T` として借用する。
    ///
    /// # Safety
    /// - `T` は 1 フレームに収まり、4KiB アラインで足りること。
    /// - 同じフレームへの別の可変参照が同時に生きていないこと。
    pub unsafe fn frame_mut<'a, T>(&self, frame: PhysFrame) -> &'a mut T {
        debug_assert!(core::mem::size_of::<T>() <= PAGE_SIZE as usize);
        &mut *(self.phys_to_virt(frame.start_address()) as *mut T)
    }

    /// # Safety
    /// - frame が窓の中にあり、他から参照されていないこと。
    pub unsafe fn zero_frame(&self, frame: PhysFrame) {
        core::ptr::write_bytes(self.phys_to_virt(frame.start_address()), 0, PAGE_SIZE as usize);
    }

    /// # Safety
    /// - src / dst が窓の中にあり、互いに異なるフレームであること。
    pub unsafe fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        core::ptr::copy_nonoverlapping(
            self.phys_to_virt(src.start_address()) as *const u8,
            self.phys_to_virt(dst.start_address()),
            PAGE_SIZE as usize,
        );
    }
}

// free list の終端（ページ境界でない値なので実フレームと衝突しない）
const FREE_LIST_END: u32 = u32::MAX;

// 4GiB 以上は i386 の物理アドレスで表せない
const PHYS_LIMIT: u64 = 1 << 32;

/// memory map の Usable 領域から 4KiB フレームを払い出すアロケータ。
///
/// - 状態: `regions`（不変入力）、`region` / `cursor`（次に払い出す位置）、free list
/// - 解放されたフレームは先頭 4 byte に「次の空きフレームの物理アドレス」を書いて
///   単方向リストにつなぐ（追加のメモリを使わない）。
pub struct PoolFrameAllocator<'a> {
    regions: &'a [MemoryRegion],
    window: PhysWindow,
    region: usize,
    cursor: u64,
    free_head: u32,
}

impl<'a> PoolFrameAllocator<'a> {
    /// # Safety
    /// - regions 上で Usable とされたフレームを、他のコードが使っていないこと。
    /// - window がそれらのフレームすべてを覆っていること。
    pub unsafe fn new(regions: &'a [MemoryRegion], window: PhysWindow) -> Self {
        PoolFrameAllocator {
            regions,
            window,
            region: 0,
            cursor: 0,
            free_head: FREE_LIST_END,
        }
    }

    /// まだ払い出していないフレームを memory map の順に 1 枚返す。
    fn next_fresh(&mut self) -> Option<PhysFrame> {
        let page = PAGE_SIZE as u64;

        while let Some(r) = self.regions.get(self.region) {
            if r.region_type == MemoryRegionType::Usable {
                // 先頭はページ境界に切り上げ、末尾は切り捨て
                let start = (r.start_phys + page - 1) & !(page - 1);
                let end = r.end_phys.min(PHYS_LIMIT) & !(page - 1);

                let addr = self.cursor.max(start);
                if addr < end {
                    self.cursor = addr + page;
                    return Some(PhysAddr(addr as u32).frame());
                }
            }

            self.region += 1;
            self.cursor = 0;
        }
        None
    }
}

impl FrameAllocator for PoolFrameAllocator<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_head != FREE_LIST_END {
            let frame = PhysAddr(self.free_head).frame();
            // Safety: free list 上のフレームは誰からも参照されていない
            self.free_head = unsafe { *(self.window.phys_to_virt(frame.start_address()) as *const u32) };
            return Some(frame);
        }

        self.next_fresh()
    }

    fn free_frame(&mut self, frame: PhysFrame) {
        // Safety: 解放されたフレームはもう誰からも参照されていない
        unsafe {
            *(self.window.phys_to_virt(frame.start_address()) as *mut u32) = self.free_head;
        }
        self.free_head = frame.start_address().0;
    }
}
