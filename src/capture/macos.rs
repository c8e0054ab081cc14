//! macOS platform using CGEvent taps and the CoreGraphics window list.
//!
//! Each stream runs its own listen-only event tap on a dedicated thread with
//! its own run loop. Requires Accessibility and Input Monitoring permission.

use crate::capture::{
    Bounds, KeyCallback, KeyInput, MouseButton, MouseCallback, MouseInput, PlatformCapability,
    PlatformError, Permissions, Subscription, WindowInfo,
};
use chrono::Utc;
use core_foundation::base::{CFType, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
use core_foundation::number::CFNumber;
use core_foundation::runloop::{kCFRunLoopCommonModes, CFRunLoop};
use core_foundation::string::{CFString, CFStringRef};
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventType, CallbackResult, EventField,
};
use core_graphics::geometry::CGRect;
use core_graphics::window::{
    copy_window_info, kCGNullWindowID, kCGWindowBounds, kCGWindowLayer,
    kCGWindowListExcludeDesktopElements, kCGWindowListOptionOnScreenOnly, kCGWindowName,
    kCGWindowOwnerName, kCGWindowOwnerPID,
};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn AXIsProcessTrustedWithOptions(options: CFDictionaryRef) -> bool;
    fn CGPreflightListenEventAccess() -> bool;
    fn CGRequestListenEventAccess() -> bool;
    fn CGPreflightScreenCaptureAccess() -> bool;
    fn CGRequestScreenCaptureAccess() -> bool;
}

/// kCGEventTargetUnixProcessID
const EVENT_TARGET_UNIX_PROCESS_ID: u32 = 40;

/// The macOS platform.
#[derive(Debug, Default)]
pub struct MacOSPlatform;

impl MacOSPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformCapability for MacOSPlatform {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn current_window(&self) -> Result<WindowInfo, PlatformError> {
        frontmost_window()
    }

    fn subscribe_keyboard(&self, callback: KeyCallback) -> Result<Subscription, PlatformError> {
        spawn_tap(
            "keyboard",
            vec![CGEventType::KeyDown],
            move |_event_type, event| {
                let keycode = event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE);
                let pid = event.get_integer_value_field(EVENT_TARGET_UNIX_PROCESS_ID);
                let flags = event.get_flags();
                let modifiers = Modifiers {
                    shift: flags.contains(CGEventFlags::CGEventFlagShift),
                    caps_lock: flags.contains(CGEventFlags::CGEventFlagAlphaShift),
                };
                callback(KeyInput {
                    key: key_name(keycode, modifiers),
                    pid: (pid > 0).then_some(pid as i32),
                    application: None,
                    timestamp: Utc::now(),
                });
            },
        )
    }

    fn subscribe_mouse(&self, callback: MouseCallback) -> Result<Subscription, PlatformError> {
        spawn_tap(
            "mouse",
            vec![
                CGEventType::MouseMoved,
                CGEventType::LeftMouseDown,
                CGEventType::RightMouseDown,
                CGEventType::OtherMouseDown,
                CGEventType::ScrollWheel,
            ],
            move |event_type, event| {
                if let Some(input) = mouse_input(event_type, event) {
                    callback(input);
                }
            },
        )
    }

    fn check_permissions(&self) -> Permissions {
        unsafe {
            Permissions {
                accessibility: accessibility_trusted(false),
                input_monitoring: CGPreflightListenEventAccess(),
                screen_recording: CGPreflightScreenCaptureAccess(),
            }
        }
    }

    fn request_permissions(&self) -> bool {
        unsafe {
            let accessibility = accessibility_trusted(true);
            let input_monitoring = CGRequestListenEventAccess();
            // Best-effort: titles of other apps' windows need this
            let _ = CGRequestScreenCaptureAccess();
            accessibility && input_monitoring
        }
    }
}

/// Query accessibility trust, optionally prompting the user.
fn accessibility_trusted(prompt: bool) -> bool {
    let key = CFString::new("AXTrustedCheckOptionPrompt");
    let value = if prompt {
        CFBoolean::true_value()
    } else {
        CFBoolean::false_value()
    };
    let options = CFDictionary::from_CFType_pairs(&[(key.as_CFType(), value.as_CFType())]);
    unsafe { AXIsProcessTrustedWithOptions(options.as_concrete_TypeRef()) }
}

/// Run a listen-only event tap on its own thread.
///
/// Returns once the tap is installed, or with the installation error.
fn spawn_tap<F>(
    source_name: &'static str,
    event_types: Vec<CGEventType>,
    handler: F,
) -> Result<Subscription, PlatformError>
where
    F: Fn(CGEventType, &CGEvent) + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let alive = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = bounded::<Result<(), PlatformError>>(1);

    let thread_running = running.clone();
    let thread_alive = alive.clone();
    let handle = thread::Builder::new()
        .name(format!("footprint-{source_name}-tap"))
        .spawn(move || {
            let tap = CGEventTap::new(
                CGEventTapLocation::Session,
                CGEventTapPlacement::HeadInsertEventTap,
                CGEventTapOptions::ListenOnly,
                event_types,
                |_proxy, event_type, event| {
                    handler(event_type, event);
                    // Passive observer: the event continues unchanged
                    CallbackResult::Keep
                },
            );
            let tap = match tap {
                Ok(tap) => tap,
                Err(_) => {
                    thread_alive.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(PlatformError::HookFailed {
                        source_name,
                        reason: "CGEventTap creation refused".to_string(),
                    }));
                    return;
                }
            };

            let source = match tap.mach_port().create_runloop_source(0) {
                Ok(source) => source,
                Err(_) => {
                    thread_alive.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(PlatformError::HookFailed {
                        source_name,
                        reason: "run loop source creation failed".to_string(),
                    }));
                    return;
                }
            };

            let run_loop = CFRunLoop::get_current();
            unsafe {
                run_loop.add_source(&source, kCFRunLoopCommonModes);
            }
            tap.enable();
            let _ = ready_tx.send(Ok(()));

            while thread_running.load(Ordering::SeqCst) {
                CFRunLoop::run_in_mode(
                    unsafe { kCFRunLoopCommonModes },
                    Duration::from_millis(100),
                    false,
                );
            }

            // The tap is disabled when dropped
            thread_alive.store(false, Ordering::SeqCst);
        })
        .map_err(|e| PlatformError::HookFailed {
            source_name,
            reason: e.to_string(),
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = handle.join();
            return Err(e);
        }
        Err(_) => {
            let _ = handle.join();
            return Err(PlatformError::HookFailed {
                source_name,
                reason: "tap thread exited before signaling readiness".to_string(),
            });
        }
    }

    let mut handle = Some(handle);
    Ok(Subscription::new(alive, move || {
        running.store(false, Ordering::SeqCst);
        if let Some(handle) = handle.take() {
            let _ = handle.join();
        }
    }))
}

/// Convert a tapped mouse event into a [`MouseInput`].
fn mouse_input(event_type: CGEventType, event: &CGEvent) -> Option<MouseInput> {
    let location = event.location();
    let (x, y) = (location.x as i32, location.y as i32);
    let pid = event.get_integer_value_field(EVENT_TARGET_UNIX_PROCESS_ID);

    let mut input = match event_type {
        CGEventType::MouseMoved => MouseInput::movement(x, y),
        CGEventType::LeftMouseDown => MouseInput::click(x, y, MouseButton::Left),
        CGEventType::RightMouseDown => MouseInput::click(x, y, MouseButton::Right),
        CGEventType::OtherMouseDown => MouseInput::click(x, y, MouseButton::Middle),
        CGEventType::ScrollWheel => {
            let delta_y = event.get_double_value_field(
                EventField::SCROLL_WHEEL_EVENT_POINT_DELTA_AXIS_1,
            );
            MouseInput::scroll(x, y, delta_y)
        }
        _ => return None,
    };
    input.pid = (pid > 0).then_some(pid as i32);
    Some(input)
}

/// Read the frontmost normal-layer window from the on-screen window list.
///
/// The list is ordered front to back, so the first layer-0 entry is the
/// focused application's key window.
fn frontmost_window() -> Result<WindowInfo, PlatformError> {
    let windows = copy_window_info(
        kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements,
        kCGNullWindowID,
    )
    .ok_or_else(|| PlatformError::Query("CGWindowListCopyWindowInfo returned null".into()))?;

    for item in windows.iter() {
        let entry: CFDictionary<CFString, CFType> =
            unsafe { CFDictionary::wrap_under_get_rule(*item as CFDictionaryRef) };

        let layer = number_field(&entry, unsafe { kCGWindowLayer }).unwrap_or(-1);
        if layer != 0 {
            continue;
        }

        let application = string_field(&entry, unsafe { kCGWindowOwnerName }).unwrap_or_default();
        // Titles are empty without screen recording permission
        let title = string_field(&entry, unsafe { kCGWindowName }).unwrap_or_default();
        let pid = number_field(&entry, unsafe { kCGWindowOwnerPID }).unwrap_or(0) as i32;
        let bounds = bounds_field(&entry).unwrap_or_default();

        return Ok(WindowInfo::new(application, title)
            .with_pid(pid)
            .with_bounds(bounds));
    }

    Err(PlatformError::NoFocusedWindow)
}

fn string_field(entry: &CFDictionary<CFString, CFType>, key: CFStringRef) -> Option<String> {
    let key = unsafe { CFString::wrap_under_get_rule(key) };
    entry
        .find(&key)
        .and_then(|value| value.downcast::<CFString>())
        .map(|value| value.to_string())
}

fn number_field(entry: &CFDictionary<CFString, CFType>, key: CFStringRef) -> Option<i64> {
    let key = unsafe { CFString::wrap_under_get_rule(key) };
    entry
        .find(&key)
        .and_then(|value| value.downcast::<CFNumber>())
        .and_then(|value| value.to_i64())
}

fn bounds_field(entry: &CFDictionary<CFString, CFType>) -> Option<Bounds> {
    let key = unsafe { CFString::wrap_under_get_rule(kCGWindowBounds) };
    let value = entry.find(&key)?;
    let dict = value.downcast::<CFDictionary>()?;
    let rect = CGRect::from_dict_representation(&dict)?;
    Some(Bounds {
        x: rect.origin.x as i32,
        y: rect.origin.y as i32,
        width: rect.size.width as i32,
        height: rect.size.height as i32,
    })
}

/// Modifier state that changes the character a key produces.
#[derive(Debug, Clone, Copy, Default)]
struct Modifiers {
    shift: bool,
    caps_lock: bool,
}

/// Name for an ANSI virtual keycode.
///
/// Printable keys map to the character a US layout produces under
/// `modifiers`; everything else gets a bracketed name so payloads stay
/// readable after decryption.
fn key_name(keycode: i64, modifiers: Modifiers) -> String {
    let name = match keycode {
        0 => "a",
        1 => "s",
        2 => "d",
        3 => "f",
        4 => "h",
        5 => "g",
        6 => "z",
        7 => "x",
        8 => "c",
        9 => "v",
        11 => "b",
        12 => "q",
        13 => "w",
        14 => "e",
        15 => "r",
        16 => "y",
        17 => "t",
        18 => "1",
        19 => "2",
        20 => "3",
        21 => "4",
        22 => "6",
        23 => "5",
        24 => "=",
        25 => "9",
        26 => "7",
        27 => "-",
        28 => "8",
        29 => "0",
        30 => "]",
        31 => "o",
        32 => "u",
        33 => "[",
        34 => "i",
        35 => "p",
        36 => "<Return>",
        37 => "l",
        38 => "j",
        39 => "'",
        40 => "k",
        41 => ";",
        42 => "\\",
        43 => ",",
        44 => "/",
        45 => "n",
        46 => "m",
        47 => ".",
        48 => "<Tab>",
        49 => " ",
        50 => "`",
        51 => "<Backspace>",
        53 => "<Escape>",
        117 => "<Delete>",
        123 => "<Left>",
        124 => "<Right>",
        125 => "<Down>",
        126 => "<Up>",
        other => return format!("<{other}>"),
    };

    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_lowercase() => {
            if modifiers.shift != modifiers.caps_lock {
                c.to_ascii_uppercase().to_string()
            } else {
                name.to_string()
            }
        }
        (Some(c), None) if modifiers.shift => shifted(c).unwrap_or(c).to_string(),
        _ => name.to_string(),
    }
}

/// US layout Shift variant of a digit or punctuation key.
fn shifted(c: char) -> Option<char> {
    let pair = match c {
        '1' => '!',
        '2' => '@',
        '3' => '#',
        '4' => '$',
        '5' => '%',
        '6' => '^',
        '7' => '&',
        '8' => '*',
        '9' => '(',
        '0' => ')',
        '-' => '_',
        '=' => '+',
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        ';' => ':',
        '\'' => '"',
        ',' => '<',
        '.' => '>',
        '/' => '?',
        '`' => '~',
        _ => return None,
    };
    Some(pair)
}
