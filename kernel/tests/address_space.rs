// kernel/tests/address_space.rs
//
// map / unmap / 問い合わせ / superpage / CR3 切替を、模擬マシン上の Vmm で確認する。

mod common;

use common::*;
use i386_vm::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use i386_vm::mem::address_space::VmError;
use i386_vm::mem::layout::{KERNEL_BASE_VA, LINEAR_MAPPING_END};
use i386_vm::mem::paging::PageFlags;

const USER_VA: VirtAddr = VirtAddr(0x0804_8000);

#[test]
fn map_query_unmap_round_trip() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0x5a);

    assert!(!vmm.is_mapped(&dir, USER_VA));
    vmm.map(&dir, USER_VA, pa, true, true).unwrap();

    assert!(vmm.is_mapped(&dir, USER_VA));
    assert_eq!(vmm.get_mapping(&dir, VirtAddr(USER_VA.0 + 0x123)), pa);
    assert_eq!(vmm.ref_count(pa), 1);
    assert_eq!(read_virt(&vmm, &dir, VirtAddr(USER_VA.0 + 7)), 0x5a);

    let entry = vmm.lookup_entry(&dir, USER_VA).unwrap();
    assert!(entry.flags().contains(PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE));
    assert!(!entry.flags().contains(PageFlags::GLOBAL));
    assert!(!entry.is_cow());

    assert_eq!(vmm.unmap(&dir, USER_VA), 0);
    assert!(!vmm.is_mapped(&dir, USER_VA));
    assert_eq!(vmm.ref_count(pa), 0);

    // map と unmap の両方で TLB を捨てている
    let hits = vmm.mmu().invalidated.iter().filter(|v| **v == USER_VA).count();
    assert_eq!(hits, 2);

    // unmap はフレームを解放しない
    assert!(!vmm.frames().was_freed(pa));
}

#[test]
fn kernel_pages_are_global_and_user_pages_are_not() {
    let mut vmm = vmm(64);
    let pa = data_frame(&mut vmm, 0);
    let va = VirtAddr(0xff00_0000);

    vmm.map_kernel_page(va, pa, false, true).unwrap();

    let entry = vmm.lookup_entry(vmm.kernel_dir(), va).unwrap();
    assert!(entry.flags().contains(PageFlags::GLOBAL | PageFlags::WRITABLE));
    assert!(!entry.flags().contains(PageFlags::USER));
}

#[test]
fn page_table_is_created_once_per_directory_entry() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let a = data_frame(&mut vmm, 0);
    let b = data_frame(&mut vmm, 0);
    let c = data_frame(&mut vmm, 0);

    let before = vmm.frames().allocs;
    vmm.map(&dir, VirtAddr(0x0800_0000), a, true, true).unwrap();
    vmm.map(&dir, VirtAddr(0x0800_1000), b, true, true).unwrap();
    assert_eq!(vmm.frames().allocs, before + 1);

    // 別の 4MiB 範囲
    vmm.map(&dir, VirtAddr(0x0840_0000), c, true, true).unwrap();
    assert_eq!(vmm.frames().allocs, before + 2);
}

#[test]
fn map_reports_out_of_memory_without_side_effects() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);

    vmm.frames_mut().set_budget(Some(0));
    assert_eq!(vmm.map(&dir, USER_VA, pa, true, true), Err(VmError::OutOfMemory));

    assert!(!vmm.is_mapped(&dir, USER_VA));
    assert_eq!(vmm.ref_count(pa), 0);
}

#[test]
fn map_pages_rolls_back_on_out_of_memory() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let first = data_frame(&mut vmm, 0);
    let second = data_frame(&mut vmm, 0);
    let third = data_frame(&mut vmm, 0);
    assert_eq!(second.0, first.0 + PAGE_SIZE);
    assert_eq!(third.0, second.0 + PAGE_SIZE);

    // 1 枚目は PDE 0、2 枚目以降は PDE 1。PDE 1 の page table が取れない。
    let va = VirtAddr(0x0040_0000 - PAGE_SIZE);
    vmm.frames_mut().set_budget(Some(1));

    assert_eq!(
        vmm.map_pages(&dir, va, first, 3, true, true),
        Err(VmError::OutOfMemory)
    );

    assert!(!vmm.is_mapped(&dir, va));
    assert!(!vmm.is_mapped(&dir, VirtAddr(0x0040_0000)));
    for pa in [first, second, third] {
        assert_eq!(vmm.ref_count(pa), 0);
    }
}

#[test]
fn map_pages_maps_a_contiguous_run() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let first = data_frame(&mut vmm, 0);
    let _second = data_frame(&mut vmm, 0);

    vmm.map_pages(&dir, USER_VA, first, 2, true, false).unwrap();

    assert_eq!(vmm.get_mapping(&dir, USER_VA), first);
    assert_eq!(
        vmm.get_mapping(&dir, VirtAddr(USER_VA.0 + PAGE_SIZE)),
        PhysAddr(first.0 + PAGE_SIZE)
    );
    assert!(!vmm.lookup_entry(&dir, USER_VA).unwrap().is_writable());

    vmm.unmap_pages(&dir, USER_VA, 2);
    assert!(!vmm.is_mapped(&dir, USER_VA));
}

#[test]
fn unmap_returns_the_remaining_reference_count() {
    let mut vmm = vmm(64);
    let a = vmm.clone_kernel_dir().unwrap();
    let b = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);

    vmm.map(&a, USER_VA, pa, true, true).unwrap();
    vmm.map(&b, USER_VA, pa, true, true).unwrap();
    assert_eq!(vmm.ref_count(pa), 2);

    assert_eq!(vmm.unmap(&a, USER_VA), 1);
    assert_eq!(vmm.unmap(&b, USER_VA), 0);
}

#[test]
fn set_page_rw_toggles_write_permission_only() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);
    vmm.map(&dir, USER_VA, pa, true, true).unwrap();

    vmm.set_page_rw(&dir, USER_VA, false);
    assert!(write_virt(&vmm, &dir, USER_VA, 1).is_err());
    assert_eq!(vmm.get_mapping(&dir, USER_VA), pa);
    assert_eq!(vmm.ref_count(pa), 1);

    vmm.set_page_rw(&dir, USER_VA, true);
    assert!(write_virt(&vmm, &dir, USER_VA, 1).is_ok());
    assert_eq!(read_virt(&vmm, &dir, USER_VA), 1);
}

#[test]
fn untracked_frames_can_be_mapped() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let mmio = PhysAddr(MMIO_PADDR);

    vmm.map(&dir, USER_VA, mmio, true, true).unwrap();
    assert_eq!(vmm.get_mapping(&dir, USER_VA), mmio);
    assert_eq!(vmm.ref_count(mmio), 0);
    assert_eq!(vmm.unmap(&dir, USER_VA), 0);
}

#[test]
fn superpage_translation() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();

    vmm.map_4mb(&dir, VirtAddr(0x0800_0000), PhysAddr(0x1000_0000), PageFlags::WRITABLE);

    assert!(vmm.is_mapped(&dir, VirtAddr(0x083f_f000)));
    assert_eq!(
        vmm.get_mapping(&dir, VirtAddr(0x0800_5123)),
        PhysAddr(0x1000_5000)
    );
    // superpage には PTE が無い
    assert!(vmm.lookup_entry(&dir, VirtAddr(0x0800_5000)).is_none());
}

#[test]
fn kernel_linear_map_covers_rounded_up_physical_memory() {
    let mut vmm = vmm(64);

    vmm.map_kernel_linear(10 * 1024 * 1024);

    assert!(vmm.mmu().large_pages);
    let kdir = vmm.kernel_dir();
    assert!(vmm.is_mapped(kdir, VirtAddr(KERNEL_BASE_VA)));
    assert!(vmm.is_mapped(kdir, VirtAddr(KERNEL_BASE_VA + 0x00bf_f000)));
    assert!(!vmm.is_mapped(kdir, VirtAddr(KERNEL_BASE_VA + 0x00c0_0000)));

    // clone にも共有される
    let dir = vmm.clone_kernel_dir().unwrap();
    assert!(vmm.is_mapped(&dir, VirtAddr(KERNEL_BASE_VA + 0x0010_0000)));
}

#[test]
fn kernel_linear_map_is_capped() {
    let mut vmm = vmm(64);

    vmm.map_kernel_linear(4 * 1024 * 1024 * 1024);

    let kdir = vmm.kernel_dir();
    assert!(vmm.is_mapped(kdir, VirtAddr(LINEAR_MAPPING_END - PAGE_SIZE)));
    assert!(!vmm.is_mapped(kdir, VirtAddr(LINEAR_MAPPING_END)));
}

#[test]
fn set_page_directory_loads_the_root() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();

    vmm.set_page_directory(&dir);
    assert!(vmm.is_current(&dir));
    assert_eq!(vmm.current_root(), dir.root());
    assert_eq!(vmm.mmu().roots.last(), Some(&dir.root_paddr()));

    vmm.switch_to_kernel_dir();
    assert!(!vmm.is_current(&dir));
    assert_eq!(vmm.mmu().roots.last(), Some(&PhysAddr(KERNEL_DIR_PADDR)));
}

// ─────────────────────────────────────────────
// プログラミングエラー
// ─────────────────────────────────────────────

#[test]
#[should_panic(expected = "map: page already mapped")]
fn double_map_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);

    vmm.map(&dir, USER_VA, pa, true, true).unwrap();
    let _ = vmm.map(&dir, USER_VA, pa, true, true);
}

#[test]
#[should_panic(expected = "unmap: page not mapped")]
fn unmap_of_absent_page_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    vmm.unmap(&dir, USER_VA);
}

#[test]
#[should_panic(expected = "map: vaddr is not page-aligned")]
fn misaligned_map_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);
    let _ = vmm.map(&dir, VirtAddr(USER_VA.0 + 4), pa, true, true);
}

#[test]
#[should_panic(expected = "set_page_rw: page not mapped")]
fn set_page_rw_on_absent_page_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    vmm.set_page_rw(&dir, USER_VA, true);
}

#[test]
#[should_panic(expected = "map_4mb: directory entry already in use")]
fn superpage_over_existing_entry_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    vmm.map_4mb(&dir, VirtAddr(0x0800_0000), PhysAddr(0x1000_0000), PageFlags::WRITABLE);
    vmm.map_4mb(&dir, VirtAddr(0x0800_0000), PhysAddr(0x1040_0000), PageFlags::WRITABLE);
}

#[test]
#[should_panic(expected = "map: inside a 4MiB mapping")]
fn page_inside_superpage_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);
    vmm.map_4mb(&dir, VirtAddr(0x0800_0000), PhysAddr(0x1000_0000), PageFlags::WRITABLE);
    let _ = vmm.map(&dir, VirtAddr(0x0800_1000), pa, true, true);
}

#[test]
#[should_panic(expected = "get_mapping on the kernel linear map")]
fn get_mapping_rejects_the_linear_map() {
    let mut vmm = vmm(64);
    vmm.map_kernel_linear(8 * 1024 * 1024);
    vmm.get_mapping(vmm.kernel_dir(), VirtAddr(KERNEL_BASE_VA + 0x1000));
}

#[test]
fn is_mapped_distinguishes_pages_within_one_table() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);
    vmm.map(&dir, USER_VA, pa, true, true).unwrap();

    assert!(vmm.is_mapped(&dir, USER_VA));
    assert!(!vmm.is_mapped(&dir, VirtAddr(USER_VA.0 + PAGE_SIZE)));
    assert!(!vmm.is_mapped(&dir, VirtAddr(USER_VA.0 - PAGE_SIZE)));
}

#[test]
#[should_panic(expected = "map: kernel range through a process page directory")]
fn kernel_range_map_through_a_process_directory_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    let pa = data_frame(&mut vmm, 0);
    let _ = vmm.map(&dir, VirtAddr(0xf840_0000), pa, false, true);
}

#[test]
#[should_panic(expected = "map: kernel range through a process page directory")]
fn kernel_range_superpage_through_a_process_directory_panics() {
    let mut vmm = vmm(64);
    let dir = vmm.clone_kernel_dir().unwrap();
    vmm.map_4mb(&dir, VirtAddr(0xfc00_0000), PhysAddr(0x1000_0000), PageFlags::WRITABLE);
}

#[test]
fn kernel_range_pages_go_through_the_shared_kernel_table() {
    let mut vmm = vmm(64);
    let outstanding = vmm.frames().outstanding();
    let va = VirtAddr(0xf840_0000);

    // page table は clone より先に kernel directory に作っておく
    let first = data_frame(&mut vmm, 0);
    vmm.map_kernel_page(va, first, false, true).unwrap();

    let a = vmm.clone_kernel_dir().unwrap();
    let b = vmm.clone_kernel_dir().unwrap();

    let second = data_frame(&mut vmm, 0);
    vmm.map_kernel_page(VirtAddr(va.0 + PAGE_SIZE), second, false, true)
        .unwrap();
    for dir in [&a, &b] {
        assert_eq!(vmm.get_mapping(dir, VirtAddr(va.0 + PAGE_SIZE)), second);
    }

    vmm.destroy(a);
    vmm.destroy(b);
    assert_eq!(vmm.ref_count(first), 1);
    assert_eq!(vmm.ref_count(second), 1);
    assert_eq!(vmm.check_refcounts(&[]), 0);

    // 残っているのは kernel 側の page table と 2 枚のデータだけ
    assert_eq!(vmm.frames().outstanding(), outstanding + 3);
}
