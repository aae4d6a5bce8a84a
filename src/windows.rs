//! Live process access through the Win32 and native APIs.

use std::ffi::c_void;
use std::mem::{size_of, zeroed};
use std::ptr::null_mut;

use once_cell::sync::OnceCell;
use once_cell::unsync::OnceCell as LocalOnceCell;
use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{ERROR_BAD_LENGTH, GetLastError};
use windows_sys::Win32::Storage::FileSystem::{GetLogicalDrives, QueryDosDeviceW};
use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{MEMORY_BASIC_INFORMATION, VirtualQueryEx};
use windows_sys::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetMappedFileNameW, GetModuleBaseNameW, LIST_MODULES_64BIT,
    QueryWorkingSet, QueryWorkingSetEx,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::{
    OpenProcess, OpenThread, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    THREAD_QUERY_LIMITED_INFORMATION,
};

use crate::classifier::ClassifierPolicy;
use crate::error::{RegionError, Result};
use crate::memory::{BasicInfo, WorkingSetBlock, WorkingSetExBlock, WorkingSetExEntry};
use crate::process_operations::{
    ProcessAccess, ProcessOpener, SystemInfo, TargetProcess, ThreadInfo,
};
use crate::raw_ptr::OwnedHandle;
use crate::utils::replace_device_prefix;

const PROCESS_BASIC_INFORMATION_CLASS: u32 = 0;
const PROCESS_WOW64_INFORMATION_CLASS: u32 = 26;
const THREAD_BASIC_INFORMATION_CLASS: u32 = 0;
const SYSTEM_HYPERVISOR_SHARED_PAGE_INFORMATION: u32 = 0xc5;

const WORKING_SET_RETRIES: usize = 8;
const MAX_MODULES: usize = 1024;

#[repr(C)]
struct ProcessBasicInformation {
    exit_status: i32,
    peb_base_address: usize,
    affinity_mask: usize,
    base_priority: i32,
    unique_process_id: usize,
    inherited_from_unique_process_id: usize,
}

#[repr(C)]
struct ClientId {
    unique_process: usize,
    unique_thread: usize,
}

#[repr(C)]
struct ThreadBasicInformation {
    exit_status: i32,
    teb_base_address: usize,
    client_id: ClientId,
    affinity_mask: usize,
    priority: i32,
    base_priority: i32,
}

#[repr(C)]
struct OsVersionInfo {
    size: u32,
    major_version: u32,
    minor_version: u32,
    build_number: u32,
    platform_id: u32,
    csd_version: [u16; 128],
}

/// `MEMORY_WORKING_SET_EX_INFORMATION` with the attribute union as raw bits.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawWorkingSetExInformation {
    virtual_address: usize,
    attributes: usize,
}

#[link(name = "ntdll")]
unsafe extern "system" {
    fn NtQueryInformationProcess(
        process: *mut c_void,
        class: u32,
        information: *mut c_void,
        length: u32,
        return_length: *mut u32,
    ) -> i32;

    fn NtQueryInformationThread(
        thread: *mut c_void,
        class: u32,
        information: *mut c_void,
        length: u32,
        return_length: *mut u32,
    ) -> i32;

    fn NtQuerySystemInformation(
        class: u32,
        information: *mut c_void,
        length: u32,
        return_length: *mut u32,
    ) -> i32;

    fn RtlGetVersion(info: *mut OsVersionInfo) -> i32;
}

fn nt_success(status: i32) -> bool {
    status >= 0
}

fn last_error(call: &'static str) -> RegionError {
    RegionError::Os {
        call,
        code: unsafe { GetLastError() },
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Build number of the running OS, or 0 if it cannot be determined.
pub fn current_build() -> u32 {
    unsafe {
        let mut info: OsVersionInfo = zeroed();
        info.size = size_of::<OsVersionInfo>() as u32;
        if nt_success(RtlGetVersion(&mut info)) {
            info.build_number
        } else {
            0
        }
    }
}

/// Classification policy for the running OS.
pub fn current_policy() -> ClassifierPolicy {
    let build = current_build();
    debug!(build, "detected OS build");
    ClassifierPolicy::for_build(build, cfg!(target_pointer_width = "64"))
}

fn query_system_info() -> SystemInfo {
    unsafe {
        let mut info: SYSTEM_INFO = zeroed();
        GetSystemInfo(&mut info);
        SystemInfo {
            page_size: info.dwPageSize as u64,
            allocation_granularity: info.dwAllocationGranularity as u64,
        }
    }
}

static HYPERVISOR_SHARED_VA: OnceCell<Option<u64>> = OnceCell::new();

/// The hypervisor shared page is mapped at the same address in every
/// process, so it is queried once.
fn hypervisor_shared_va() -> Option<u64> {
    *HYPERVISOR_SHARED_VA.get_or_init(|| unsafe {
        let mut va: usize = 0;
        let status = NtQuerySystemInformation(
            SYSTEM_HYPERVISOR_SHARED_PAGE_INFORMATION,
            &mut va as *mut usize as *mut c_void,
            size_of::<usize>() as u32,
            null_mut(),
        );
        if nt_success(status) && va != 0 {
            Some(va as u64)
        } else {
            debug!(status, "hypervisor shared page unavailable");
            None
        }
    })
}

/// Opens processes with `OpenProcess`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsOpener;

impl ProcessOpener for WindowsOpener {
    type Process = WindowsProcess;

    fn open(&self, process_id: u32, access: ProcessAccess) -> Result<WindowsProcess> {
        let rights = match access {
            ProcessAccess::QueryAndRead => PROCESS_QUERY_INFORMATION | PROCESS_VM_READ,
            ProcessAccess::QueryOnly => PROCESS_QUERY_INFORMATION,
        };

        let raw = unsafe { OpenProcess(rights, 0, process_id) };
        let handle = OwnedHandle::new(raw).ok_or_else(|| last_error("OpenProcess"))?;

        Ok(WindowsProcess {
            handle,
            process_id,
            system: query_system_info(),
            device_map: LocalOnceCell::new(),
        })
    }
}

pub struct WindowsProcess {
    handle: OwnedHandle,
    process_id: u32,
    system: SystemInfo,
    device_map: LocalOnceCell<Vec<(String, String)>>,
}

impl WindowsProcess {
    fn query_process(&self, class: u32, information: *mut c_void, length: usize) -> bool {
        let status = unsafe {
            NtQueryInformationProcess(
                self.handle.raw(),
                class,
                information,
                length as u32,
                null_mut(),
            )
        };
        nt_success(status)
    }

    fn teb_of_thread(thread_id: u32) -> Option<u64> {
        let raw = unsafe { OpenThread(THREAD_QUERY_LIMITED_INFORMATION, 0, thread_id) };
        let thread = OwnedHandle::new(raw)?;

        let mut info: ThreadBasicInformation = unsafe { zeroed() };
        let status = unsafe {
            NtQueryInformationThread(
                thread.raw(),
                THREAD_BASIC_INFORMATION_CLASS,
                &mut info as *mut _ as *mut c_void,
                size_of::<ThreadBasicInformation>() as u32,
                null_mut(),
            )
        };
        nt_success(status).then_some(info.teb_base_address as u64)
    }

    /// `(device, drive)` pairs for every logical drive, built on first use.
    fn device_map(&self) -> &[(String, String)] {
        self.device_map.get_or_init(|| {
            let drives = unsafe { GetLogicalDrives() };
            let mut map = Vec::new();
            let mut target = [0u16; 512];

            for letter in 0..26u8 {
                if drives & (1 << letter) == 0 {
                    continue;
                }
                let drive = format!("{}:", (b'A' + letter) as char);
                let name = wide(&drive);
                let len = unsafe {
                    QueryDosDeviceW(name.as_ptr(), target.as_mut_ptr(), target.len() as u32)
                };
                if len == 0 {
                    continue;
                }
                let device_end = target.iter().position(|c| *c == 0).unwrap_or(target.len());
                map.push((String::from_utf16_lossy(&target[..device_end]), drive));
            }
            map
        })
    }

    fn module_base(&self, module: &str) -> Option<u64> {
        let mut modules = vec![null_mut::<c_void>(); MAX_MODULES];
        let mut needed = 0u32;
        let ok = unsafe {
            EnumProcessModulesEx(
                self.handle.raw(),
                modules.as_mut_ptr(),
                (modules.len() * size_of::<*mut c_void>()) as u32,
                &mut needed,
                LIST_MODULES_64BIT,
            )
        };
        if ok == 0 {
            trace!(pid = self.process_id, "EnumProcessModulesEx failed");
            return None;
        }

        let count = (needed as usize / size_of::<*mut c_void>()).min(modules.len());
        let mut name = [0u16; 260];
        modules[..count].iter().find_map(|&base| {
            let len = unsafe {
                GetModuleBaseNameW(self.handle.raw(), base, name.as_mut_ptr(), name.len() as u32)
            } as usize;
            (len > 0 && String::from_utf16_lossy(&name[..len]).eq_ignore_ascii_case(module))
                .then_some(base as u64)
        })
    }
}

impl TargetProcess for WindowsProcess {
    fn system_info(&self) -> SystemInfo {
        self.system
    }

    fn query_basic(&self, address: u64) -> Option<BasicInfo> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { zeroed() };
        let written = unsafe {
            VirtualQueryEx(
                self.handle.raw(),
                address as usize as *const c_void,
                &mut mbi,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return None;
        }

        Some(BasicInfo {
            base_address: mbi.BaseAddress as u64,
            allocation_base: mbi.AllocationBase as u64,
            allocation_protect: mbi.AllocationProtect,
            region_size: mbi.RegionSize as u64,
            state: mbi.State,
            protect: mbi.Protect,
            kind: mbi.Type,
        })
    }

    fn query_working_set_ex(&self, entries: &mut [WorkingSetExEntry]) -> Result<()> {
        let mut raw: Vec<RawWorkingSetExInformation> = entries
            .iter()
            .map(|entry| RawWorkingSetExInformation {
                virtual_address: entry.virtual_address as usize,
                attributes: 0,
            })
            .collect();

        let ok = unsafe {
            QueryWorkingSetEx(
                self.handle.raw(),
                raw.as_mut_ptr() as *mut c_void,
                (raw.len() * size_of::<RawWorkingSetExInformation>()) as u32,
            )
        };
        if ok == 0 {
            return Err(last_error("QueryWorkingSetEx"));
        }

        for (entry, info) in entries.iter_mut().zip(&raw) {
            entry.attributes = WorkingSetExBlock::from_bits(info.attributes as u64);
        }
        Ok(())
    }

    fn query_working_set(&self) -> Result<Vec<WorkingSetBlock>> {
        // Layout: NumberOfEntries followed by one packed block per page.
        let mut capacity = 0x4000usize;

        for _ in 0..WORKING_SET_RETRIES {
            let mut buffer = vec![0usize; capacity + 1];
            let ok = unsafe {
                QueryWorkingSet(
                    self.handle.raw(),
                    buffer.as_mut_ptr() as *mut c_void,
                    (buffer.len() * size_of::<usize>()) as u32,
                )
            };

            if ok != 0 {
                let count = buffer[0].min(capacity);
                return Ok(buffer[1..=count]
                    .iter()
                    .map(|bits| WorkingSetBlock::from_bits(*bits as u64))
                    .collect());
            }

            let code = unsafe { GetLastError() };
            if code != ERROR_BAD_LENGTH {
                return Err(RegionError::Os {
                    call: "QueryWorkingSet",
                    code,
                });
            }
            capacity = buffer[0].max(capacity * 2) + 0x100;
        }

        Err(RegionError::Os {
            call: "QueryWorkingSet",
            code: ERROR_BAD_LENGTH,
        })
    }

    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        let mut bytes_read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.raw(),
                address as usize as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
                &mut bytes_read,
            )
        };
        if ok == 0 && bytes_read == 0 {
            return Err(last_error("ReadProcessMemory"));
        }
        Ok(bytes_read)
    }

    fn peb_address(&self) -> Option<u64> {
        let mut info: ProcessBasicInformation = unsafe { zeroed() };
        self.query_process(
            PROCESS_BASIC_INFORMATION_CLASS,
            &mut info as *mut _ as *mut c_void,
            size_of::<ProcessBasicInformation>(),
        )
        .then_some(info.peb_base_address as u64)
        .filter(|peb| *peb != 0)
    }

    fn peb32_address(&self) -> Option<u64> {
        if cfg!(not(target_pointer_width = "64")) {
            return None;
        }
        let mut peb32: usize = 0;
        self.query_process(
            PROCESS_WOW64_INFORMATION_CLASS,
            &mut peb32 as *mut usize as *mut c_void,
            size_of::<usize>(),
        )
        .then_some(peb32 as u64)
        .filter(|peb| *peb != 0)
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
        let snapshot =
            OwnedHandle::new(raw).ok_or_else(|| last_error("CreateToolhelp32Snapshot"))?;

        let mut entry: THREADENTRY32 = unsafe { zeroed() };
        entry.dwSize = size_of::<THREADENTRY32>() as u32;

        let mut threads = Vec::new();
        let mut more = unsafe { Thread32First(snapshot.raw(), &mut entry) } != 0;
        while more {
            if entry.th32OwnerProcessID == self.process_id {
                match Self::teb_of_thread(entry.th32ThreadID) {
                    Some(teb_base) => threads.push(ThreadInfo {
                        thread_id: entry.th32ThreadID,
                        teb_base,
                    }),
                    None => trace!(thread_id = entry.th32ThreadID, "could not query TEB"),
                }
            }
            more = unsafe { Thread32Next(snapshot.raw(), &mut entry) } != 0;
        }

        Ok(threads)
    }

    fn mapped_file_name(&self, address: u64) -> Option<String> {
        let mut name = [0u16; 1024];
        let len = unsafe {
            GetMappedFileNameW(
                self.handle.raw(),
                address as usize as *const c_void,
                name.as_mut_ptr(),
                name.len() as u32,
            )
        } as usize;
        (len > 0).then(|| String::from_utf16_lossy(&name[..len]))
    }

    fn resolve_device_path(&self, path: &str) -> Option<String> {
        replace_device_prefix(path, self.device_map())
    }

    fn remote_symbol(&self, module: &str, symbol: &str) -> Option<u64> {
        // RVA from the local copy, base from the target's module list.
        let local_base = unsafe { GetModuleHandleW(wide(module).as_ptr()) };
        if local_base.is_null() {
            return None;
        }

        let mut symbol_name = symbol.as_bytes().to_vec();
        symbol_name.push(0);
        let export = unsafe { GetProcAddress(local_base, symbol_name.as_ptr()) }?;
        let rva = (export as usize).checked_sub(local_base as usize)? as u64;

        let remote_base = self.module_base(module)?;
        Some(remote_base + rva)
    }

    fn hypervisor_shared_va(&self) -> Option<u64> {
        hypervisor_shared_va()
    }
}
