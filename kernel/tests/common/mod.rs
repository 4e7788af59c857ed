// kernel/tests/common/mod.rs
//
// ホスト上の模擬マシン。
// - 4KiB 境界のホストバッファを「物理メモリ BASE..」として PhysWindow で覗く
// - フレームアロケータは PoolFrameAllocator を包み、確保/解放回数と二重解放を検査する
// - Mmu / Cpu / Diagnostics / FaultRegistry は記録するだけの差し替え

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashSet;

use i386_vm::arch::cpu::Cpu;
use i386_vm::arch::interrupts::{Diagnostics, FaultHandler, FaultKind, FaultRegistry, FaultReport, Symbol};
use i386_vm::arch::paging::Mmu;
use i386_vm::mem::addr::{PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE};
use i386_vm::mem::address_space::{PageDir, Vmm};
use i386_vm::mm::{FrameAllocator, PhysWindow, PoolFrameAllocator};
use i386_vm::types::{phys_mem_size, MemoryRegion};

/// 模擬物理メモリの先頭
pub const BASE: u32 = 0x0040_0000;

/// アロケータ外の固定フレーム
pub const KERNEL_DIR_PADDR: u32 = BASE;
pub const VDSO_PADDR: u32 = BASE + PAGE_SIZE;

/// 物理メモリ上限より上にある（参照カウント管理外の）MMIO フレーム
pub const MMIO_PADDR: u32 = 0xfec0_0000;

#[repr(C, align(4096))]
struct Page([u8; 4096]);

pub struct Machine {
    pub window: PhysWindow,
    pub regions: &'static [MemoryRegion],
}

impl Machine {
    /// frames 枚ぶんの物理メモリ。先頭 2 枚は kernel directory と vdso 用に予約。
    pub fn new(frames: usize) -> Self {
        let mem: Vec<Page> = (0..frames).map(|_| Page([0; 4096])).collect();
        let mem: &'static mut [Page] = Box::leak(mem.into_boxed_slice());
        let offset = (mem.as_mut_ptr() as usize).wrapping_sub(BASE as usize);

        let end = BASE as u64 + (frames as u64) * PAGE_SIZE as u64;
        let regions: &'static [MemoryRegion] = Box::leak(Box::new([
            MemoryRegion::reserved(BASE as u64, BASE as u64 + 2 * PAGE_SIZE as u64),
            MemoryRegion::usable(BASE as u64 + 2 * PAGE_SIZE as u64, end),
            MemoryRegion::reserved(MMIO_PADDR as u64, MMIO_PADDR as u64 + PAGE_SIZE as u64),
        ]));

        Machine {
            window: unsafe { PhysWindow::new(offset) },
            regions,
        }
    }

    pub fn phys_mem_size(&self) -> u64 {
        phys_mem_size(self.regions)
    }

    pub fn frames(&self) -> TestFrames {
        TestFrames::new(unsafe { PoolFrameAllocator::new(self.regions, self.window) })
    }
}

// ─────────────────────────────────────────────
// FrameAllocator
// ─────────────────────────────────────────────

pub struct TestFrames {
    pool: PoolFrameAllocator<'static>,
    live: HashSet<u32>,
    pub allocs: usize,
    pub frees: usize,
    pub freed: Vec<PhysFrame>,
    budget: Option<usize>,
}

impl TestFrames {
    fn new(pool: PoolFrameAllocator<'static>) -> Self {
        TestFrames {
            pool,
            live: HashSet::new(),
            allocs: 0,
            frees: 0,
            freed: Vec::new(),
            budget: None,
        }
    }

    /// あと n 回だけ確保に成功させる（None で無制限）
    pub fn set_budget(&mut self, n: Option<usize>) {
        self.budget = n;
    }

    /// 確保されていて未解放のフレーム数
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    pub fn was_freed(&self, paddr: PhysAddr) -> bool {
        self.freed.contains(&paddr.frame())
    }
}

impl FrameAllocator for TestFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(n) = self.budget {
            if n == 0 {
                return None;
            }
            self.budget = Some(n - 1);
        }

        let frame = self.pool.allocate_frame()?;
        assert!(self.live.insert(frame.number), "allocator handed out a live frame {:?}", frame);
        self.allocs += 1;
        Some(frame)
    }

    fn free_frame(&mut self, frame: PhysFrame) {
        assert!(self.live.remove(&frame.number), "double free or foreign frame {:?}", frame);
        self.frees += 1;
        self.freed.push(frame);
        self.pool.free_frame(frame);
    }
}

// ─────────────────────────────────────────────
// Mmu
// ─────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMmu {
    pub invalidated: Vec<VirtAddr>,
    pub roots: Vec<PhysAddr>,
    pub flushes: usize,
    pub large_pages: bool,
}

impl Mmu for FakeMmu {
    fn invalidate_page(&mut self, vaddr: VirtAddr) {
        self.invalidated.push(vaddr);
    }

    fn load_root(&mut self, root: PhysAddr) {
        self.roots.push(root);
    }

    fn flush_all(&mut self) {
        self.flushes += 1;
    }

    fn enable_large_pages(&mut self) {
        self.large_pages = true;
    }
}

// ─────────────────────────────────────────────
// Cpu / Diagnostics / FaultRegistry
// ─────────────────────────────────────────────

/// 例外入口直後の状態（割り込み禁止・preemption 禁止）から始まる CPU
#[derive(Default)]
pub struct FakeCpu {
    pub cr2: Cell<u32>,
    pub irq: Cell<bool>,
    pub preempt: Cell<bool>,
    pub irq_enables: Cell<u32>,
}

impl Cpu for FakeCpu {
    fn fault_address(&self) -> VirtAddr {
        VirtAddr(self.cr2.get())
    }

    fn interrupts_enabled(&self) -> bool {
        self.irq.get()
    }

    fn enable_interrupts(&self) {
        self.irq.set(true);
        self.irq_enables.set(self.irq_enables.get() + 1);
    }

    fn disable_interrupts(&self) {
        self.irq.set(false);
    }

    fn preemption_enabled(&self) -> bool {
        self.preempt.get()
    }
}

/// kernel text の先頭（シンボル解決の基準）
pub const KERNEL_TEXT: u32 = 0xc010_0000;

#[derive(Default)]
pub struct FakeDiag {
    pub panicking: Cell<bool>,
}

impl Diagnostics for FakeDiag {
    fn in_panic(&self) -> bool {
        self.panicking.get()
    }

    fn resolve_symbol(&self, addr: u32) -> Option<Symbol> {
        (addr >= KERNEL_TEXT).then(|| Symbol {
            name: "kmain",
            offset: addr - KERNEL_TEXT,
        })
    }

    fn fatal(&self, report: &FaultReport) -> ! {
        self.panicking.set(true);
        panic!("{}", report)
    }

    fn halt_forever(&self, msg: &str) -> ! {
        panic!("halt: {}", msg)
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    pub handlers: Vec<(FaultKind, FaultHandler)>,
}

impl FakeRegistry {
    pub fn handler(&self, kind: FaultKind) -> FaultHandler {
        self.handlers
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, h)| *h)
            .expect("no handler registered")
    }
}

impl FaultRegistry for FakeRegistry {
    fn set_fault_handler(&mut self, kind: FaultKind, handler: FaultHandler) {
        self.handlers.push((kind, handler));
    }
}

// ─────────────────────────────────────────────
// Vmm を使うテストの組み立て
// ─────────────────────────────────────────────

pub type TestVmm = Vmm<TestFrames, FakeMmu>;

pub fn kernel_dir_frame() -> PhysFrame {
    PhysAddr(KERNEL_DIR_PADDR).frame()
}

/// 参照カウント表まで初期化した Vmm
pub fn vmm(frames: usize) -> TestVmm {
    let m = Machine::new(frames);
    let mut vmm = Vmm::new(m.window, m.frames(), FakeMmu::default(), kernel_dir_frame());
    vmm.init_refcounts(m.phys_mem_size()).unwrap();
    vmm
}

/// データ用のフレームを 1 枚取って中身を byte で埋める
pub fn data_frame(vmm: &mut TestVmm, byte: u8) -> PhysAddr {
    let frame = vmm.frames_mut().allocate_frame().unwrap();
    fill(vmm.window(), frame.start_address(), byte);
    frame.start_address()
}

pub fn fill(window: &PhysWindow, paddr: PhysAddr, byte: u8) {
    unsafe { std::ptr::write_bytes(window.phys_to_virt(paddr), byte, PAGE_SIZE as usize) };
}

pub fn read_phys(window: &PhysWindow, paddr: PhysAddr) -> Vec<u8> {
    let p = window.phys_to_virt(paddr) as *const u8;
    unsafe { std::slice::from_raw_parts(p, PAGE_SIZE as usize) }.to_vec()
}

/// dir の下で vaddr を読む（マップされていなければ panic）
pub fn read_virt(vmm: &TestVmm, dir: &PageDir, vaddr: VirtAddr) -> u8 {
    let pa = vmm.get_mapping(dir, vaddr);
    let off = (vaddr.0 & (PAGE_SIZE - 1)) as usize;
    unsafe { *vmm.window().phys_to_virt(pa).add(off) }
}

/// CPU のように書き込む: PTE が writable でなければ書かずに Err（= #PF）
pub fn write_virt(vmm: &TestVmm, dir: &PageDir, vaddr: VirtAddr, value: u8) -> Result<(), ()> {
    let entry = vmm.lookup_entry(dir, vaddr).ok_or(())?;
    if !entry.is_writable() {
        return Err(());
    }
    let off = (vaddr.0 & (PAGE_SIZE - 1)) as usize;
    unsafe { *vmm.window().phys_to_virt(entry.frame().start_address()).add(off) = value };
    Ok(())
}
