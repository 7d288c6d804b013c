//! Windows event log source for service lifecycle events.
//!
//! The source is registered under the Application log with
//! `EventCreate.exe` as its message file, which renders any event id in
//! 1..=1000 as its single insertion string. Start, stop and failure of the
//! service are written there; everything else goes through `tracing`.

use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use windows_sys::Win32::Foundation::{ERROR_SUCCESS, HANDLE, WIN32_ERROR};
use windows_sys::Win32::System::EventLog::{
    DeregisterEventSource, RegisterEventSourceW, ReportEventW, EVENTLOG_ERROR_TYPE,
    EVENTLOG_INFORMATION_TYPE, EVENTLOG_WARNING_TYPE, REPORT_EVENT_TYPE,
};
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegDeleteKeyW, RegSetValueExW, HKEY, HKEY_LOCAL_MACHINE,
    KEY_SET_VALUE, REG_CREATE_KEY_DISPOSITION, REG_DWORD, REG_EXPAND_SZ, REG_OPENED_EXISTING_KEY,
    REG_OPTION_NON_VOLATILE,
};

const SOURCES_KEY: &str = r"SYSTEM\CurrentControlSet\Services\EventLog\Application";
const MESSAGE_FILE: &str = r"%SystemRoot%\System32\EventCreate.exe";

/// Event id of every lifecycle event.
pub const LIFECYCLE_EVENT_ID: u32 = 1;

fn source_key(name: &str) -> String {
    format!(r"{SOURCES_KEY}\{name}")
}

/// NUL-terminated UTF-16.
fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn supported_types() -> u32 {
    u32::from(EVENTLOG_ERROR_TYPE | EVENTLOG_WARNING_TYPE | EVENTLOG_INFORMATION_TYPE)
}

fn check(code: WIN32_ERROR) -> io::Result<()> {
    if code == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(code as i32))
    }
}

/// Register `name` as an event source. Fails if the source already exists.
pub fn install_source(name: &str) -> io::Result<()> {
    let path = wide(&source_key(name));
    let mut raw: HKEY = ptr::null_mut();
    let mut disposition: REG_CREATE_KEY_DISPOSITION = 0;
    // SAFETY: `path` is NUL-terminated and both out-pointers are valid locals.
    check(unsafe {
        RegCreateKeyExW(
            HKEY_LOCAL_MACHINE,
            path.as_ptr(),
            0,
            ptr::null(),
            REG_OPTION_NON_VOLATILE,
            KEY_SET_VALUE,
            ptr::null(),
            &mut raw,
            &mut disposition,
        )
    })?;
    let key = RegistryKey(raw);

    if disposition == REG_OPENED_EXISTING_KEY {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("event log source {name} already exists"),
        ));
    }

    let written = key
        .set_expand_string("EventMessageFile", MESSAGE_FILE)
        .and_then(|()| key.set_dword("TypesSupported", supported_types()))
        .and_then(|()| key.set_dword("CustomSource", 1));
    if let Err(e) = written {
        drop(key);
        let _ = remove_source(name);
        return Err(e);
    }
    Ok(())
}

/// Delete the event source registration for `name`.
pub fn remove_source(name: &str) -> io::Result<()> {
    let path = wide(&source_key(name));
    // SAFETY: `path` is NUL-terminated.
    check(unsafe { RegDeleteKeyW(HKEY_LOCAL_MACHINE, path.as_ptr()) })
}

struct RegistryKey(HKEY);

impl RegistryKey {
    fn set_dword(&self, name: &str, value: u32) -> io::Result<()> {
        let name = wide(name);
        let data = value.to_le_bytes();
        // SAFETY: the key is open and `data` outlives the call.
        check(unsafe {
            RegSetValueExW(
                self.0,
                name.as_ptr(),
                0,
                REG_DWORD,
                data.as_ptr(),
                data.len() as u32,
            )
        })
    }

    fn set_expand_string(&self, name: &str, value: &str) -> io::Result<()> {
        let name = wide(name);
        let data = wide(value);
        // SAFETY: the size passed is the byte length of `data`, terminator included.
        check(unsafe {
            RegSetValueExW(
                self.0,
                name.as_ptr(),
                0,
                REG_EXPAND_SZ,
                data.as_ptr().cast(),
                (data.len() * std::mem::size_of::<u16>()) as u32,
            )
        })
    }
}

impl Drop for RegistryKey {
    fn drop(&mut self) {
        // SAFETY: the handle came from RegCreateKeyExW and is closed once.
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

/// Open handle to a registered event source.
#[derive(Debug)]
pub struct EventLog {
    handle: HANDLE,
}

impl EventLog {
    pub fn open(name: &str) -> io::Result<Self> {
        let source = wide(name);
        // SAFETY: `source` is NUL-terminated; a null server means the local machine.
        let handle = unsafe { RegisterEventSourceW(ptr::null(), source.as_ptr()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle })
    }

    pub fn info(&self, message: &str) -> io::Result<()> {
        self.report(EVENTLOG_INFORMATION_TYPE, message)
    }

    pub fn error(&self, message: &str) -> io::Result<()> {
        self.report(EVENTLOG_ERROR_TYPE, message)
    }

    fn report(&self, kind: REPORT_EVENT_TYPE, message: &str) -> io::Result<()> {
        let text = wide(message);
        let strings = [text.as_ptr()];
        // SAFETY: one insertion string, alive for the duration of the call.
        let ok = unsafe {
            ReportEventW(
                self.handle,
                kind,
                0,
                LIFECYCLE_EVENT_ID,
                ptr::null_mut(),
                strings.len() as u16,
                0,
                strings.as_ptr(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        // SAFETY: the handle came from RegisterEventSourceW and is released once.
        unsafe {
            DeregisterEventSource(self.handle);
        }
    }
}
