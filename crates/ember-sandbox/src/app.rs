use std::sync::Arc;

use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow};
use winit::window::{Window, WindowId};

use ember_gfx::RenderConfig;
use ember_gfx::RenderingSystem;
use ember_gfx::hal::PresentTarget;

/// Window configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub title: String,
    pub initial_size: LogicalSize<f64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            title: "ember sandbox".to_string(),
            initial_size: LogicalSize::new(800.0, 600.0),
        }
    }
}

struct Running {
    // Dropped first: flushes the queue while the window is still alive.
    renderer: RenderingSystem,
    window: Arc<Window>,
}

/// winit application driving one [`RenderingSystem`].
pub struct Sandbox {
    config: SandboxConfig,
    render: RenderConfig,
    running: Option<Running>,
    failure: Option<anyhow::Error>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, render: RenderConfig) -> Self {
        Self {
            config,
            render,
            running: None,
            failure: None,
        }
    }

    /// Outcome of the run: the first error that stopped the loop, if any.
    pub fn finish(mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            running.renderer.shutdown().context("renderer shutdown failed")?;
        }
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start(&self, event_loop: &ActiveEventLoop) -> Result<Running> {
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(self.config.initial_size)
            .with_resizable(false);

        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .context("failed to create window")?,
        );
        let size = window.inner_size();

        let renderer = RenderingSystem::new(
            PresentTarget::window(Arc::clone(&window)),
            size.width,
            size.height,
            self.render.clone(),
        )
        .context("failed to initialize rendering")?;

        log::info!(
            "rendering {}x{} on {}",
            size.width,
            size.height,
            renderer.device().adapter_info().name
        );
        Ok(Running { renderer, window })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{error:#}");
        self.failure.get_or_insert(error);
        event_loop.exit();
    }

    fn close(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(running) = self.running.take() {
            let frames = running.renderer.frames_rendered();
            match running.renderer.shutdown() {
                Ok(()) => log::info!("closed after {frames} frames"),
                Err(e) => {
                    let err = anyhow::Error::new(e).context("renderer shutdown failed");
                    self.fail(event_loop, err);
                    return;
                }
            }
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for Sandbox {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }

        match self.start(event_loop) {
            Ok(running) => {
                running.window.request_redraw();
                self.running = Some(running);
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);

        // Continuous redraw.
        if let Some(running) = &self.running {
            running.window.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => self.close(event_loop),

            WindowEvent::Resized(size) => {
                // The swap chain keeps its creation size.
                log::debug!("resize to {}x{} ignored", size.width, size.height);
            }

            WindowEvent::RedrawRequested => {
                let Some(running) = self.running.as_mut() else {
                    return;
                };
                if let Err(e) = running.renderer.render_frame() {
                    self.running = None;
                    self.fail(event_loop, anyhow::Error::new(e).context("frame failed"));
                }
            }

            _ => {}
        }
    }
}
