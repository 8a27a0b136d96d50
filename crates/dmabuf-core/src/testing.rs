//! Test exporter shared by unit tests

use crate::access::DmaDirection;
use crate::attachment::{DmaBufAttachment, Device};
use crate::buffer::{DmaBuf, ExportInfo};
use crate::ops::{DmaBufOps, VAddr, VmArea};
use crate::sg_table::SgTable;
use crate::{Error, Result, PAGE_SIZE};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Base of the fake device address space
pub(crate) const TEST_DMA_BASE: u64 = 0x8000_0000;

/// Hook invocation counters
#[derive(Default)]
pub(crate) struct Counters {
    pub attach: AtomicUsize,
    pub detach: AtomicUsize,
    pub map: AtomicUsize,
    pub unmap: AtomicUsize,
    pub release: AtomicUsize,
    pub begin_cpu: AtomicUsize,
    pub end_cpu: AtomicUsize,
    pub kunmap: AtomicUsize,
    pub mmap: AtomicUsize,
    pub vmap: AtomicUsize,
    pub vunmap: AtomicUsize,
}

/// Heap-backed exporter recording every hook call
pub(crate) struct TestExporter {
    memory: VAddr,
    size: usize,
    pub counters: Counters,
    pub fail_attach: AtomicBool,
    pub fail_vmap: AtomicBool,
    pub fail_begin_cpu: AtomicBool,
}

impl TestExporter {
    pub fn new(size: usize) -> Arc<Self> {
        let memory = Box::into_raw(vec![0u8; size.max(1)].into_boxed_slice()) as *mut u8;
        Arc::new(Self {
            memory: VAddr::new(memory).unwrap(),
            size,
            counters: Counters::default(),
            fail_attach: AtomicBool::new(false),
            fail_vmap: AtomicBool::new(false),
            fail_begin_cpu: AtomicBool::new(false),
        })
    }

    fn page(&self, page_num: usize) -> Option<VAddr> {
        (page_num * PAGE_SIZE < self.size).then(|| unsafe { self.memory.add(page_num * PAGE_SIZE) })
    }
}

impl Drop for TestExporter {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.memory.as_ptr(), self.size.max(1));
        drop(unsafe { Box::from_raw(slice) });
    }
}

fn exporter(buf: &DmaBuf) -> &TestExporter {
    buf.private::<TestExporter>().unwrap()
}

fn test_attach(buf: &DmaBuf, dev: &Device, attach: &DmaBufAttachment) -> Result<()> {
    let exp = exporter(buf);
    if exp.fail_attach.load(Ordering::SeqCst) {
        return Err(Error::InvalidArgument(format!("{} rejected", dev.name())));
    }
    attach.set_private(dev.name().to_string());
    exp.counters.attach.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn test_detach(buf: &DmaBuf, _attach: &DmaBufAttachment) {
    exporter(buf).counters.detach.fetch_add(1, Ordering::SeqCst);
}

fn test_map(buf: &DmaBuf, _attach: &DmaBufAttachment, _dir: DmaDirection) -> Result<SgTable> {
    exporter(buf).counters.map.fetch_add(1, Ordering::SeqCst);
    let mut sg = SgTable::new();
    for page in 0..buf.num_pages() {
        // every other page, so segments do not merge
        sg.push(TEST_DMA_BASE + (2 * page * PAGE_SIZE) as u64, PAGE_SIZE);
    }
    Ok(sg)
}

fn test_unmap(buf: &DmaBuf, _attach: &DmaBufAttachment, _sg: SgTable, _dir: DmaDirection) {
    exporter(buf).counters.unmap.fetch_add(1, Ordering::SeqCst);
}

fn test_release(buf: &DmaBuf) {
    exporter(buf).counters.release.fetch_add(1, Ordering::SeqCst);
}

fn test_begin_cpu(buf: &DmaBuf, _start: usize, _len: usize, _dir: DmaDirection) -> Result<()> {
    let exp = exporter(buf);
    if exp.fail_begin_cpu.load(Ordering::SeqCst) {
        return Err(Error::WouldBlock);
    }
    exp.counters.begin_cpu.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn test_end_cpu(buf: &DmaBuf, _start: usize, _len: usize, _dir: DmaDirection) {
    exporter(buf).counters.end_cpu.fetch_add(1, Ordering::SeqCst);
}

fn test_kmap(buf: &DmaBuf, page_num: usize) -> Option<VAddr> {
    exporter(buf).page(page_num)
}

fn test_kunmap(buf: &DmaBuf, _page_num: usize, _vaddr: VAddr) {
    exporter(buf).counters.kunmap.fetch_add(1, Ordering::SeqCst);
}

fn test_mmap(buf: &DmaBuf, vma: &mut VmArea) -> Result<()> {
    let exp = exporter(buf);
    exp.counters.mmap.fetch_add(1, Ordering::SeqCst);
    vma.mapping = exp.page(vma.pgoff);
    Ok(())
}

fn test_vmap(buf: &DmaBuf) -> Option<VAddr> {
    let exp = exporter(buf);
    if exp.fail_vmap.load(Ordering::SeqCst) {
        return None;
    }
    exp.counters.vmap.fetch_add(1, Ordering::SeqCst);
    Some(exp.memory)
}

fn test_vunmap(buf: &DmaBuf, _vaddr: VAddr) {
    exporter(buf).counters.vunmap.fetch_add(1, Ordering::SeqCst);
}

pub(crate) static TEST_OPS: DmaBufOps = DmaBufOps {
    attach: Some(test_attach),
    detach: Some(test_detach),
    map_dma_buf: Some(test_map),
    unmap_dma_buf: Some(test_unmap),
    release: Some(test_release),
    begin_cpu_access: Some(test_begin_cpu),
    end_cpu_access: Some(test_end_cpu),
    kmap_atomic: Some(test_kmap),
    kunmap_atomic: Some(test_kunmap),
    kmap: Some(test_kmap),
    kunmap: Some(test_kunmap),
    mmap: Some(test_mmap),
    vmap: Some(test_vmap),
    vunmap: Some(test_vunmap),
};

/// Export a test buffer of `size` bytes
pub(crate) fn test_buffer(size: usize) -> (Arc<DmaBuf>, Arc<TestExporter>) {
    let exp = TestExporter::new(size);
    let buf = DmaBuf::export(
        ExportInfo::new(&TEST_OPS, size)
            .private(Arc::clone(&exp))
            .exp_name("test"),
    )
    .unwrap();
    (buf, exp)
}

/// Export a test buffer without reservation state
pub(crate) fn test_buffer_nosync(size: usize) -> (Arc<DmaBuf>, Arc<TestExporter>) {
    let exp = TestExporter::new(size);
    let buf = DmaBuf::export(
        ExportInfo::new(&TEST_OPS, size)
            .private(Arc::clone(&exp))
            .exp_name("test")
            .without_sync(),
    )
    .unwrap();
    (buf, exp)
}
