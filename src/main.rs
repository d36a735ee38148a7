use dynamic_raytracing::{RenderError, Renderer, RendererConfig};
use winit::{
    event::{DeviceEvent, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

const TITLE: &str = "Dynamic Ray Tracing";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = RendererConfig::from_env();
    log::info!("Starting {} on {}", TITLE, std::env::consts::OS);
    log::debug!("{:?}", config);

    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title(TITLE)
        .with_inner_size(winit::dpi::LogicalSize::new(config.width as f64, config.height as f64))
        .with_resizable(false)
        .build(&event_loop)?;

    window.set_cursor_visible(false);
    if window.set_cursor_grab(winit::window::CursorGrabMode::Locked).is_err() {
        let _ = window.set_cursor_grab(winit::window::CursorGrabMode::Confined);
    }

    let mut renderer = match Renderer::new(&window, &config) {
        Ok(r) => {
            log::info!("Renderer initialized successfully");
            r
        }
        Err(e) => {
            log::error!("Failed to initialize renderer: {}", e);
            match &e {
                RenderError::NoSuitableDevice(_) => {
                    log::error!("A GPU with VK_KHR_ray_tracing_pipeline and VK_KHR_acceleration_structure is required.");
                }
                RenderError::MemoryExhaustion { .. } => {
                    log::error!("Close other GPU-heavy applications or pick a discrete GPU.");
                }
                _ => {}
            }
            return Err(e.into());
        }
    };

    log::info!("");
    log::info!("=== CONTROLS ===");
    log::info!("  Mouse: Look around");
    log::info!("  W/A/S/D: Move horizontally");
    log::info!("  Q/E: Move up/down");
    log::info!("  ESC: Exit");
    log::info!("================");
    log::info!("");

    let mut frame_count = 0u32;
    let mut last_fps_update = std::time::Instant::now();

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(KeyCode::Escape),
                            ..
                        },
                    ..
                } => elwt.exit(),
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(key),
                            state,
                            ..
                        },
                    ..
                } => {
                    renderer.handle_input(key, state);
                }
                WindowEvent::RedrawRequested => {
                    if let Err(e) = renderer.render() {
                        if e.is_fatal_device_state() {
                            log::error!("GPU stopped responding: {}", e);
                        } else {
                            log::error!("Render error: {}", e);
                        }
                        elwt.exit();
                        return;
                    }

                    frame_count += 1;
                    let now = std::time::Instant::now();
                    let elapsed = now.duration_since(last_fps_update).as_secs_f32();
                    if elapsed >= 0.5 {
                        let fps = frame_count as f32 / elapsed;
                        window.set_title(&format!("{} - {:.1} FPS (frame {})", TITLE, fps, renderer.frame_number()));
                        frame_count = 0;
                        last_fps_update = now;
                    }
                }
                _ => (),
            },
            Event::AboutToWait => {
                window.request_redraw();
            }
            Event::DeviceEvent {
                event: DeviceEvent::MouseMotion { delta },
                ..
            } => {
                renderer.camera.handle_mouse_input(delta.0, delta.1);
            }
            _ => (),
        }
    })?;

    Ok(())
}
