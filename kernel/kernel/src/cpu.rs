//! The process-wide CPU description.

use kernel_arch::{CpuFeatures, CpuInfo};
use kernel_sync::SyncOnceCell;

/// Populated once in [`init`], read-only afterwards; no lock needed.
static CPU_INFO: SyncOnceCell<CpuInfo> = SyncOnceCell::new();

/// Probe the boot CPU and enable every feature the kernel drives (SSE,
/// AVX, NX, VMX/SVM arming). Tells the paging layer whether the NX bit
/// is usable.
///
/// # Safety
/// CPL0, once, before anything depends on the enabled state.
pub unsafe fn init() {
    let mut info = unsafe { CpuInfo::detect() };
    unsafe { info.enable_features() };
    kernel_vmem::flags::set_nx_enabled(info.enabled().contains(CpuFeatures::NX));
    CPU_INFO
        .set(info)
        .unwrap_or_else(|_| panic!("cpu::init called twice"));
}

/// The CPU description.
///
/// # Panics
/// Before [`init`].
#[must_use]
pub fn info() -> &'static CpuInfo {
    CPU_INFO.get().expect("cpu::init has not run")
}
