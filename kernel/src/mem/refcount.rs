// kernel/src/mem/refcount.rs
//
// 役割:
// - 物理フレームごとの参照カウント表。
// - 「どの仮想マッピングがこのフレームを指しているか」の数だけを記録する。
//
// やること:
// - increment / decrement / get（いずれも物理アドレス指定）
// - 物理メモリ上限以上のフレームは管理外（常に 0 を返し、何もしない）
//
// やらないこと:
// - フレームの解放判断（0 になったかどうかは呼び出し側が見る）
// - 排他制御（割り込み禁止中にのみ触る前提）
//
// 設計方針:
// - 表は起動時に一度だけ確保し、以後サイズは変えない。
// - 0 からの decrement は二重解放なので assert で止める。

use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use crate::mem::addr::{PhysAddr, PAGE_SHIFT};

pub struct FrameRefTable {
    counts: Vec<u16>,
    // 管理対象の物理アドレス上限（exclusive）
    limit: u64,
}

impl FrameRefTable {
    /// 何も管理しない表（COW 初期化前の状態）
    pub const fn empty() -> Self {
        FrameRefTable {
            counts: Vec::new(),
            limit: 0,
        }
    }

    /// 物理メモリ `phys_mem_size` バイトぶんの表をゼロ初期化で確保する。
    pub fn for_phys_mem(phys_mem_size: u64) -> Result<Self, TryReserveError> {
        let frames = (phys_mem_size >> PAGE_SHIFT) as usize;

        let mut counts = Vec::new();
        counts.try_reserve_exact(frames)?;
        counts.resize(frames, 0);

        Ok(FrameRefTable {
            counts,
            limit: (frames as u64) << PAGE_SHIFT,
        })
    }

    /// 管理対象のフレーム数
    pub fn frame_count(&self) -> usize {
        self.counts.len()
    }

    pub fn tracks(&self, paddr: PhysAddr) -> bool {
        (paddr.0 as u64) < self.limit
    }

    fn slot(&self, paddr: PhysAddr) -> Option<usize> {
        if self.tracks(paddr) {
            Some((paddr.0 >> PAGE_SHIFT) as usize)
        } else {
            None
        }
    }

    /// 参照を 1 増やして新しい値を返す。管理外なら 0。
    pub fn increment(&mut self, paddr: PhysAddr) -> u16 {
        let Some(i) = self.slot(paddr) else {
            return 0;
        };

        let c = &mut self.counts[i];
        assert!(*c < u16::MAX, "frame refcount overflow");
        *c += 1;
        *c
    }

    /// 参照を 1 減らして新しい値を返す。管理外なら 0。
    pub fn decrement(&mut self, paddr: PhysAddr) -> u16 {
        let Some(i) = self.slot(paddr) else {
            return 0;
        };

        let c = &mut self.counts[i];
        assert!(*c > 0, "frame refcount underflow (double release)");
        *c -= 1;
        *c
    }

    pub fn get(&self, paddr: PhysAddr) -> u16 {
        match self.slot(paddr) {
            Some(i) => self.counts[i],
            None => 0,
        }
    }
}
