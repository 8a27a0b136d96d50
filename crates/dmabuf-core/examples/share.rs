//! Share one heap buffer between a "camera" writer and a "display" reader
//!
//! Run with: RUST_LOG=debug cargo run --example share

use dmabuf_core::{
    Device, DmaBufAccess, DmaBufFence, DmaDirection, FdFlags, FdTable, IoctlCmd, PollMask,
    ShmHeap, SyncContext, DMA_BUF_ACCESS_W, PAGE_SIZE,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> dmabuf_core::Result<()> {
    tracing_subscriber::fmt::init();

    let heap = ShmHeap::new(&format!("/dmabuf_share_{}", std::process::id()));
    let frame = heap.allocate(4 * PAGE_SIZE)?;
    let table = Arc::new(FdTable::new());
    let fd = frame.fd(&table, FdFlags::CLOEXEC)?;

    // the camera fills the frame under a write fence
    let mut fence = DmaBufFence {
        ctx: 0,
        access: DMA_BUF_ACCESS_W,
    };
    table.ioctl(fd, IoctlCmd::GetFence(&mut fence))?;

    let display = {
        let table = Arc::clone(&table);
        thread::spawn(move || -> dmabuf_core::Result<u8> {
            let frame = dmabuf_core::DmaBuf::get(&table, fd)?;
            let mut ready = table.poll(fd);
            while !ready.contains(PollMask::POLLIN) {
                ready = frame.poll_wait(Duration::from_millis(100));
            }
            let mut ctx = SyncContext::new("display");
            ctx.get(&frame, DmaBufAccess::Read)?;
            ctx.lock()?;
            let attach = frame.attach(&Arc::new(Device::new("display")))?;
            let sg = attach.map(DmaDirection::ToDevice)?;
            println!("display scans out {} bytes in {} segment(s)", sg.total_len(), sg.nents());
            attach.unmap(sg, DmaDirection::ToDevice);
            frame.detach(attach);

            let first = match frame.kmap(0) {
                Some(page) => {
                    let byte = unsafe { *page.as_ptr() };
                    frame.kunmap(0, page);
                    byte
                }
                None => 0,
            };
            ctx.unlock()?;
            Ok(first)
        })
    };

    {
        let _cpu = frame.begin_cpu_access(0, frame.size(), DmaDirection::ToDevice)?;
        if let Some(map) = frame.vmap_scoped() {
            unsafe { std::ptr::write_bytes(map.vaddr().as_ptr(), 0x7f, frame.size()) };
        }
    }
    table.ioctl(fd, IoctlCmd::PutFence(&mut fence))?;

    match display.join() {
        Ok(first) => println!("display read first byte {:#x}", first?),
        Err(_) => eprintln!("display thread panicked"),
    }
    table.close(fd)?;
    Ok(())
}
