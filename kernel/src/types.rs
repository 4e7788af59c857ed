/*!
 * types
 *
 * 役割:
 *   - ファームウェアから渡される物理メモリマップの素朴な型を集約する。
 *
 * やること:
 *   - MemoryRegion / MemoryRegionType の定義。
 *   - 物理メモリサイズ（参照カウント表の大きさ）を memory map から求める。
 *
 * やらないこと:
 *   - フレームの割り当て（mm 側）や、ページングの arch 依存処理。
 *
 * 設計方針:
 *   - 境界値は u64 で持つ（4GiB ちょうどの終端を表せるように）。
 */

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable,
    Reserved,
    Other,
}

impl fmt::Display for MemoryRegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRegionType::Usable => write!(f, "Usable"),
            MemoryRegionType::Reserved => write!(f, "Reserved"),
            MemoryRegionType::Other => write!(f, "Other"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub start_phys: u64,
    pub end_phys: u64,
    pub region_type: MemoryRegionType,
}

impl MemoryRegion {
    pub const fn usable(start_phys: u64, end_phys: u64) -> Self {
        MemoryRegion {
            start_phys,
            end_phys,
            region_type: MemoryRegionType::Usable,
        }
    }

    pub const fn reserved(start_phys: u64, end_phys: u64) -> Self {
        MemoryRegion {
            start_phys,
            end_phys,
            region_type: MemoryRegionType::Reserved,
        }
    }
}

/// 管理対象の物理メモリサイズ（= Usable 領域の最大終端）
///
/// Reserved 領域（MMIO 窓など）は含めない。それより上のフレームは
/// 参照カウントの管理外になる。
pub fn phys_mem_size(regions: &[MemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|r| r.region_type == MemoryRegionType::Usable)
        .map(|r| r.end_phys)
        .max()
        .unwrap_or(0)
}
