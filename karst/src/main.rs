use anyhow::Result;
use winit::{
    dpi,
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    raw_window_handle::{
        HasDisplayHandle, HasRawDisplayHandle, HasRawWindowHandle, HasWindowHandle,
    },
    window::WindowBuilder,
};

use karst_graphics::{
    graph::PassType,
    renderer::Renderer,
    types::{AccessMask, ImageAspect, StageMask},
    vk,
    vulkan::{swapchain::Window, DeviceShared},
};

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("MY_LOG_LEVEL", "debug")
        .write_style_or("MY_LOG_STYLE", "always");
    env_logger::init_from_env(env);

    // Initialize window.
    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title("karst")
        .with_inner_size(dpi::PhysicalSize::new(1280, 720))
        .build(&event_loop)?;

    let display_handle = window.display_handle()?.raw_display_handle()?;
    let window_handle = window.window_handle()?.raw_window_handle()?;

    let device = DeviceShared::new(display_handle)?;
    let render_window = Window::new(device.clone(), window_handle, display_handle)?;

    // A renderer with a single pass clearing the window.
    let mut renderer = Renderer::with_device(device, 2)?;
    renderer.attach_window(0, render_window)?;

    let pass = renderer.add_pass(PassType::Render, &[])?;
    renderer.pass_consume(pass, 0, AccessMask::ATTACHMENT_WRITE, StageMask::FRAGMENT)?;
    renderer.pass_clear(
        pass,
        0,
        ImageAspect::COLOR,
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [1.0, 0.8, 0.4, 0.0],
            },
        },
    );

    event_loop.run(move |event, elwt| match event {
        Event::WindowEvent {
            event: WindowEvent::CloseRequested,
            ..
        } => {
            elwt.exit();
        }
        Event::AboutToWait => {
            let acquired = renderer.acquire().map(|frame| frame.index());
            let submitted = acquired.and_then(|_| renderer.submit(&[]));
            if let Err(error) = submitted {
                log::error!("Frame failed: {}", error);
            }
        }
        _ => {}
    })?;

    Ok(())
}
