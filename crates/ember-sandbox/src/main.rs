//! Ember sandbox: opens a window and clears it every frame through `ember-gfx`.
//!
//! `EMBER_BACKEND=soft` runs the frame loop on the host-memory device.

mod app;

use anyhow::{Context, Result};
use winit::event_loop::EventLoop;

use ember_gfx::logging::{LoggingConfig, init_logging};
use ember_gfx::{DeviceConfig, RenderConfig};

use app::{Sandbox, SandboxConfig};

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let render = RenderConfig {
        device: DeviceConfig::from_env(),
        ..RenderConfig::default()
    };
    log::info!("starting sandbox on the {} backend", render.device.backend);

    let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
    let mut sandbox = Sandbox::new(SandboxConfig::default(), render);

    event_loop
        .run_app(&mut sandbox)
        .context("winit event loop terminated with error")?;

    sandbox.finish()
}
