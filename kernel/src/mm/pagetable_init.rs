// src/mm/pagetable_init.rs
//
// 役割：
// - page directory / page table 用に「ゼロクリア済みのフレーム」を 1 枚用意する。
// - 中身の構築（kernel PDE のコピー、PTE の複製）は mem::address_space 側で行う。

use crate::mem::addr::PhysFrame;
use crate::mm::{FrameAllocator, PhysWindow};

/// 1 フレーム確保して全エントリ無効（ゼロ）にする。確保できなければ None。
pub fn allocate_zeroed_table<A: FrameAllocator>(
    frames: &mut A,
    window: &PhysWindow,
) -> Option<PhysFrame> {
    // まず 1 フレーム確保する
    let frame = frames.allocate_frame()?;

    // Safety: 確保したばかりのフレームはまだ誰からも参照されていない
    unsafe { window.zero_frame(frame) };

    Some(frame)
}
