// Windowing - backend selection and presentation surfaces
//
// - The windowing backend is a build-time choice (`windowed` feature):
//   winit when enabled, headless otherwise
// - Surfaces are created from raw window handles, so nothing here depends
//   on winit itself

use crate::backend::device::PresentTarget;
use crate::error::{CoreError, CoreResult};
use ash::extensions::khr;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowingBackend {
    /// winit event loop presenting to a real surface
    Winit,
    /// No window; frames go to the in-process device
    Headless,
}

impl WindowingBackend {
    /// Backend compiled into this build
    pub const fn selected() -> Self {
        if cfg!(feature = "windowed") {
            WindowingBackend::Winit
        } else {
            WindowingBackend::Headless
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WindowingBackend::Winit => "winit",
            WindowingBackend::Headless => "headless",
        }
    }
}

/// Raw handles of a live window
pub fn present_target<W: HasWindowHandle + HasDisplayHandle>(window: &W) -> CoreResult<PresentTarget> {
    let window_handle = window
        .window_handle()
        .map_err(|e| CoreError::Initialization(format!("Failed to get window handle: {}", e)))?;
    let display_handle = window
        .display_handle()
        .map_err(|e| CoreError::Initialization(format!("Failed to get display handle: {}", e)))?;
    Ok(PresentTarget {
        display: display_handle.as_raw(),
        window: window_handle.as_raw(),
    })
}

/// Instance extensions needed to present on this display
pub fn surface_extensions(display: RawDisplayHandle) -> CoreResult<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(CoreError::Initialization(format!(
                "Unsupported display handle: {:?}",
                other
            )))
        }
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// Create a platform surface for the window
pub fn create_surface(
    entry: &Entry,
    instance: &Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> CoreResult<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as vk::HINSTANCE;
            let hwnd = handle.hwnd.get() as vk::HWND;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = khr::Win32Surface::new(entry, instance);
            unsafe { loader.create_win32_surface(&create_info, None) }
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut vk::Display)
                .window(handle.window);
            let loader = khr::XlibSurface::new(entry, instance);
            unsafe { loader.create_xlib_surface(&create_info, None) }
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            let loader = khr::WaylandSurface::new(entry, instance);
            unsafe { loader.create_wayland_surface(&create_info, None) }
        }
        (display, window) => {
            return Err(CoreError::Initialization(format!(
                "Unsupported window handle pair: {:?} / {:?}",
                display, window
            )))
        }
    };
    let surface = surface.map_err(|e| CoreError::Initialization(format!("Failed to create surface: {:?}", e)))?;
    log::info!("Created presentation surface");
    Ok(surface)
}
