//! A simple preview GUI.
//!
//! [`run`] takes over the main thread with the window event loop and runs the application on a
//! secondary thread. Windows are created on demand by [`show_image`], keyboard input is handed
//! back to the application through [`poll_key`].

mod renderer;

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    rc::Rc,
    sync::Mutex,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::OnceCell;
use winit::{
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopBuilder, EventLoopProxy, EventLoopWindowTarget},
    window::WindowId,
};

use crate::{
    app::Preview,
    image::{Image, Resolution},
    termination::Termination,
};

use self::renderer::{Gpu, Renderer, Window};

/// A key press, or the user closing a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Escape,
    /// A window was closed by the user.
    Closed,
}

struct Gui {
    gpu: Option<Rc<Gpu>>,
    windows: HashMap<String, Renderer>,
    win_id_to_key: HashMap<WindowId, String>,
    keys: Sender<Key>,
}

impl Gui {
    fn new(keys: Sender<Key>) -> Self {
        Self {
            gpu: None,
            windows: HashMap::new(),
            win_id_to_key: HashMap::new(),
            keys,
        }
    }

    fn gpu(&mut self) -> anyhow::Result<Rc<Gpu>> {
        match &self.gpu {
            Some(gpu) => Ok(gpu.clone()),
            None => {
                let gpu = Rc::new(pollster::block_on(Gpu::open())?);
                self.gpu = Some(gpu.clone());
                Ok(gpu)
            }
        }
    }

    fn show_image(
        &mut self,
        target: &EventLoopWindowTarget<Msg>,
        key: String,
        res: Resolution,
        data: &[u8],
    ) -> anyhow::Result<()> {
        if !self.windows.contains_key(&key) {
            log::debug!("creating window for image '{key}' at {res}");

            let win = Window::open(target, &key, res)?;
            let win_id = win.win.id();
            let renderer = Renderer::new(win, self.gpu()?)?;

            self.win_id_to_key.insert(win_id, key.clone());
            self.windows.insert(key.clone(), renderer);
        }

        if let Some(renderer) = self.windows.get_mut(&key) {
            renderer.update_texture(res, data);
            renderer.window().request_redraw();
        }
        Ok(())
    }

    fn close(&mut self, key: &str) {
        if let Some(renderer) = self.windows.remove(key) {
            log::debug!("closing window '{key}'");
            self.win_id_to_key.remove(&renderer.window().id());
        }
    }

    fn press(&self, key: Key) {
        log::trace!("key event: {key:?}");
        // Only fails when the receiver is gone, which means the process is exiting.
        self.keys.send(key).ok();
    }

    fn handle_window_event(&mut self, win: WindowId, event: WindowEvent<'_>) {
        match event {
            WindowEvent::CloseRequested => {
                if let Some(key) = self.win_id_to_key.get(&win).cloned() {
                    self.close(&key);
                }
                self.press(Key::Closed);
            }
            WindowEvent::KeyboardInput {
                input:
                    KeyboardInput {
                        state: ElementState::Pressed,
                        virtual_keycode: Some(VirtualKeyCode::Escape),
                        ..
                    },
                ..
            } => self.press(Key::Escape),
            // Escape also arrives as a control character, which is handled above.
            WindowEvent::ReceivedCharacter(c) if !c.is_control() => self.press(Key::Char(c)),
            _ => {}
        }
    }

    fn run(mut self, event_loop: EventLoop<Msg>) -> ! {
        event_loop.run(move |event, target, flow| {
            *flow = ControlFlow::Wait;
            match event {
                Event::UserEvent(Msg::Image { key, res, data }) => {
                    if let Err(e) = self.show_image(target, key, res, &data) {
                        log::error!("failed to display image: {e:#}");
                        *flow = ControlFlow::ExitWithCode(1);
                    }
                }
                Event::UserEvent(Msg::Close { key }) => self.close(&key),
                Event::WindowEvent { window_id, event } => {
                    self.handle_window_event(window_id, event)
                }
                Event::RedrawRequested(window) => {
                    let renderer = self
                        .win_id_to_key
                        .get(&window)
                        .and_then(|key| self.windows.get_mut(key));
                    if let Some(renderer) = renderer {
                        renderer.redraw();
                    }
                }
                _ => {}
            }
        });
    }
}

#[derive(Debug)]
enum Msg {
    Image {
        key: String,
        res: Resolution,
        data: Vec<u8>,
    },
    Close {
        key: String,
    },
}

/// A connection to the window event loop.
struct Display {
    proxy: Mutex<EventLoopProxy<Msg>>,
    keys: Receiver<Key>,
}

impl Display {
    fn get() -> &'static Display {
        DISPLAY.get().expect("display not initialized, use `gui::run`")
    }
}

static DISPLAY: OnceCell<Display> = OnceCell::new();

fn send(msg: Msg) {
    let proxy = match Display::get().proxy.lock() {
        Ok(proxy) => proxy,
        Err(poisoned) => poisoned.into_inner(),
    };
    if proxy.send_event(msg).is_err() {
        log::debug!("event loop closed, dropping GUI message");
    }
}

/// Runs `cb` on a secondary thread, with the window event loop on the calling thread.
///
/// This must be called from the main thread. It never returns: when `cb` finishes, the process
/// exits with a code derived from its [`Termination`] value.
pub fn run<F, R>(cb: F) -> !
where
    F: FnOnce() -> R + Send + 'static,
    R: Termination + Send,
{
    let event_loop = EventLoopBuilder::with_user_event().build();
    let (key_tx, key_rx) = crossbeam_channel::unbounded();
    let display = Display {
        proxy: Mutex::new(event_loop.create_proxy()),
        keys: key_rx,
    };
    if DISPLAY.set(display).is_err() {
        panic!("`gui::run` called more than once");
    }

    // The GUI is now initialized; spawn another thread to run the application code.
    std::thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(cb));
        match result {
            Ok(r) => {
                if r.is_success() {
                    process::exit(0);
                } else {
                    r.report(); // prints the error message
                    process::exit(1);
                }
            }
            Err(_payload) => {
                // The panic hook has printed the message already, exit with 101 like libstd.
                process::exit(101);
            }
        }
    });

    Gui::new(key_tx).run(event_loop);
}

/// Displays an image in the window named `key`, opening it if needed.
pub fn show_image(key: impl Into<String>, image: &Image) {
    // Image data is RGBA8 internally so that no conversion before GPU upload is needed.
    send(Msg::Image {
        key: key.into(),
        res: image.resolution(),
        data: image.data().to_vec(),
    });
}

/// Closes the window named `key`, if it is open.
pub fn close_window(key: impl Into<String>) {
    send(Msg::Close { key: key.into() });
}

/// Waits up to `timeout` for a key press in any window.
pub fn poll_key(timeout: Duration) -> Option<Key> {
    Display::get().keys.recv_timeout(timeout).ok()
}

/// A [`Preview`] that shows frames in a GUI window.
///
/// The window is closed when this is dropped.
pub struct GuiPreview {
    title: String,
}

impl GuiPreview {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl Preview for GuiPreview {
    fn show(&mut self, image: &Image) {
        show_image(&*self.title, image);
    }

    fn poll_key(&mut self, timeout: Duration) -> Option<Key> {
        poll_key(timeout)
    }
}

impl Drop for GuiPreview {
    fn drop(&mut self) {
        close_window(&*self.title);
    }
}
