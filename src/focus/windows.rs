//! Windows foreground-window hook.
//!
//! Installs an out-of-context `EVENT_SYSTEM_FOREGROUND` WinEvent hook on a
//! dedicated message-loop thread. The hook callback resolves the foreground
//! window to its process image path and forwards it on a channel.
//!
//! # Safety
//!
//! This module uses `unsafe` code exclusively for Windows API FFI calls.
//! All `unsafe` blocks are annotated with `// SAFETY:` comments.

#![cfg(target_os = "windows")]

use std::cell::RefCell;
use std::thread;

use crossbeam::channel::{self, Sender};
use tracing::{debug, trace, warn};
use windows::core::PWSTR;
use windows::Win32::Foundation::{CloseHandle, HWND, LPARAM, WPARAM};
use windows::Win32::System::Threading::{
    GetCurrentThreadId, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::Accessibility::{SetWinEventHook, UnhookWinEvent, HWINEVENTHOOK};
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, GetMessageW, GetWindowThreadProcessId, PeekMessageW, PostThreadMessageW,
    TranslateMessage, EVENT_SYSTEM_FOREGROUND, MSG, PM_NOREMOVE, WINEVENT_OUTOFCONTEXT, WM_QUIT,
    WM_USER,
};

use super::{FocusError, FocusEvent, FocusSource, FocusStream};

/// Longest image path `QueryFullProcessImageNameW` is asked to fill
const IMAGE_PATH_CAPACITY: usize = 1024;

thread_local! {
    // Out-of-context WinEvent callbacks run on the thread that installed the
    // hook, so the sender lives with that thread instead of in a global.
    static EVENT_SENDER: RefCell<Option<Sender<FocusEvent>>> = const { RefCell::new(None) };
}

/// Foreground-change source backed by `SetWinEventHook`
pub struct WinEventFocusSource;

impl WinEventFocusSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WinEventFocusSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusSource for WinEventFocusSource {
    fn name(&self) -> &str {
        "win-event-hook"
    }

    fn listen(self: Box<Self>) -> Result<FocusStream, FocusError> {
        let (event_tx, event_rx) = channel::unbounded::<FocusEvent>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<u32, String>>(1);

        let thread = thread::Builder::new()
            .name("echo-midi-winevent".to_string())
            .spawn(move || run_hook_message_loop(event_tx, ready_tx))
            .map_err(FocusError::Spawn)?;

        let thread_id = match ready_rx.recv() {
            Ok(Ok(id)) => id,
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(FocusError::HookInstall(reason));
            },
            Err(_) => {
                let _ = thread.join();
                return Err(FocusError::HookInstall(
                    "hook thread exited during startup".to_string(),
                ));
            },
        };

        Ok(FocusStream::new(event_rx, move || {
            // SAFETY: Posting WM_QUIT to a thread id we obtained from that
            // thread; the message queue exists because the thread peeked it
            // before reporting ready.
            let posted = unsafe { PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) };
            if let Err(e) = posted {
                warn!("Failed to post WM_QUIT to focus hook thread: {}", e);
                return;
            }
            if thread.join().is_err() {
                warn!("Focus hook thread panicked");
            }
        }))
    }
}

/// Entry point for the dedicated Win32 message loop thread.
fn run_hook_message_loop(events: Sender<FocusEvent>, ready: Sender<Result<u32, String>>) {
    let mut msg = MSG::default();

    // SAFETY: PeekMessageW on the current thread forces creation of its
    // message queue so PostThreadMessageW from the owner cannot miss.
    unsafe {
        let _ = PeekMessageW(&mut msg, None, WM_USER, WM_USER, PM_NOREMOVE);
    }

    EVENT_SENDER.with(|slot| *slot.borrow_mut() = Some(events));

    // SAFETY: Out-of-context hook with no module handle; the callback is a
    // plain extern "system" fn that lives for the whole program.
    let hook: HWINEVENTHOOK = unsafe {
        SetWinEventHook(
            EVENT_SYSTEM_FOREGROUND,
            EVENT_SYSTEM_FOREGROUND,
            None,
            Some(foreground_event_proc),
            0,
            0,
            WINEVENT_OUTOFCONTEXT,
        )
    };
    if hook.is_invalid() {
        EVENT_SENDER.with(|slot| slot.borrow_mut().take());
        let _ = ready.send(Err("SetWinEventHook returned a null handle".to_string()));
        return;
    }

    // SAFETY: Trivially safe, returns the calling thread's id.
    let thread_id = unsafe { GetCurrentThreadId() };
    if ready.send(Ok(thread_id)).is_err() {
        // SAFETY: hook was installed above on this thread.
        unsafe {
            let _ = UnhookWinEvent(hook);
        }
        return;
    }
    debug!("Foreground hook installed on thread {}", thread_id);

    // SAFETY: Standard Win32 GetMessage/DispatchMessage loop pattern. Exits
    // on WM_QUIT (0) or error (-1).
    unsafe {
        while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
        let _ = UnhookWinEvent(hook);
    }

    EVENT_SENDER.with(|slot| slot.borrow_mut().take());
    debug!("Foreground hook removed");
}

/// WinEvent callback, invoked from the message loop above.
///
/// # Safety
///
/// Called by Windows on the hook thread. Must return quickly.
unsafe extern "system" fn foreground_event_proc(
    _hook: HWINEVENTHOOK,
    event: u32,
    hwnd: HWND,
    _id_object: i32,
    _id_child: i32,
    _event_thread: u32,
    _event_time: u32,
) {
    if event != EVENT_SYSTEM_FOREGROUND || hwnd == HWND::default() {
        return;
    }

    let focus_event = match executable_of(hwnd) {
        Some(path) => FocusEvent::Foreground { executable: path },
        None => FocusEvent::Unresolved,
    };
    trace!("Foreground change: {:?}", focus_event);

    EVENT_SENDER.with(|slot| {
        if let Some(sender) = slot.borrow().as_ref() {
            let _ = sender.send(focus_event);
        }
    });
}

/// Full image path of the process owning `hwnd`.
///
/// `None` when the process cannot be opened, typically for elevated
/// processes while running unelevated.
fn executable_of(hwnd: HWND) -> Option<String> {
    let mut pid = 0u32;
    // SAFETY: hwnd comes straight from the WinEvent callback; pid is a
    // valid out pointer for the duration of the call.
    unsafe {
        GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32));
    }
    if pid == 0 {
        return None;
    }

    // SAFETY: Opening with query-limited rights only; the handle is closed
    // below on every path.
    let process = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }.ok()?;

    let mut buffer = vec![0u16; IMAGE_PATH_CAPACITY];
    let mut size = buffer.len() as u32;
    // SAFETY: buffer outlives the call and size holds its length in u16s.
    let resolved = unsafe {
        QueryFullProcessImageNameW(
            process,
            PROCESS_NAME_WIN32,
            PWSTR(buffer.as_mut_ptr()),
            &mut size,
        )
    };
    // SAFETY: process is a handle we own.
    unsafe {
        let _ = CloseHandle(process);
    }

    resolved.ok()?;
    Some(String::from_utf16_lossy(&buffer[..size as usize]))
}
