//! # WideCapture Demo
//!
//! Drives a capture session with a simulated game on the software device.
//!
//! The "game" owns one constant buffer holding a view and a projection
//! matrix. Every frame it rewrites the buffer, binds it, "renders" by
//! filling the back buffer with a colour derived from whichever camera
//! actually got bound, and presents. The session swaps the camera six times
//! per cycle and stitches the faces into equirectangular JPEG frames.
//!
//! Run with: `cargo run --example cube_session`

use anyhow::{anyhow, Context, Result};
use glam::{Mat4, Vec3};

use widecapture::camera::classifier::read_matrix;
use widecapture::{
    BufferId, BufferWrite, CallOrigin, Config, PresentFrame, SoftwareDevice, TextureId,
    WideCapture,
};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 90;
const CYCLES: u32 = 4;

fn main() -> Result<()> {
    widecapture::init_logging();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║           WideCapture Demo                                 ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║ A simulated game renders {} cycles of 7 frames; six of     ║", CYCLES);
    println!("║ each cycle become cube faces, one goes to the player.      ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    let output = std::env::temp_dir().join("widecapture-demo");
    let config = Config {
        output_directory: output.to_string_lossy().to_string(),
        record_on_attach: false,
        ..Config::preview()
    };

    let mut device = SoftwareDevice::new();
    let camera_bytes = camera_buffer(0.0);
    let camera = device.create_target_buffer(&camera_bytes);
    let back_buffer = device.create_back_buffer(WIDTH, HEIGHT);

    let capture = WideCapture::new(device, config).context("failed to start session")?;
    if !capture.start_recording() {
        return Err(anyhow!("recording could not be started"));
    }

    println!("📹 Output directory: {}", output.display());
    println!();

    let frame = PresentFrame {
        back_buffer,
        width: WIDTH,
        height: HEIGHT,
    };

    let mut shown = 0;
    for i in 0..CYCLES * 7 {
        // The player slowly turns
        let bytes = camera_buffer(i as f32 * 0.05);
        capture.with_device(|device| device.set_buffer_contents(camera, &bytes))?;
        capture.on_buffer_write(
            CallOrigin::Target,
            camera,
            bytes.len(),
            BufferWrite::full(&bytes),
        );

        let bound = capture
            .on_buffer_bind(CallOrigin::Target, 0, camera)
            .unwrap_or(camera);
        render(&capture, bound, back_buffer)?;

        if capture.on_present_attempt(&frame).present {
            shown += 1;
        }
    }

    capture.stop();

    println!();
    println!("📊 Final Statistics:");
    let stats = capture.stats();
    println!("   Frames presented to the player: {}", shown);
    println!("   Faces captured: {}", stats.capture.faces_captured);
    println!("   Cycles completed: {}", stats.capture.cycles_completed);
    println!("   Panoramas encoded: {}", stats.capture.frames_encoded);
    println!("   Camera uploads: {}", stats.camera.uploads);
    println!();
    println!("👋 Demo complete!");
    Ok(())
}

/// 128 bytes: an LH view matrix followed by a 60° LH projection.
fn camera_buffer(yaw: f32) -> Vec<u8> {
    let eye = Vec3::new(0.0, 1.7, 0.0);
    let forward = Vec3::new(yaw.sin(), 0.0, yaw.cos());
    let view = Mat4::look_at_lh(eye, eye + forward, Vec3::Y);
    let projection = Mat4::perspective_lh(60f32.to_radians(), 16.0 / 9.0, 0.1, 500.0);

    let mut floats = Vec::with_capacity(32);
    floats.extend_from_slice(&view.to_cols_array());
    floats.extend_from_slice(&projection.to_cols_array());
    bytemuck::cast_slice::<f32, u8>(&floats).to_vec()
}

/// Paints the back buffer with the bound camera's viewing direction.
fn render(
    capture: &WideCapture<SoftwareDevice>,
    bound: BufferId,
    back_buffer: TextureId,
) -> Result<()> {
    capture.with_device(|device| {
        let bytes = device
            .buffer_contents(bound)
            .ok_or_else(|| anyhow!("bound buffer {:#x} is gone", bound.0))?;
        let floats = read_matrix(bytes, 0).ok_or_else(|| anyhow!("bound buffer is too small"))?;

        // Third column of a D3D view matrix is the camera's forward axis
        let forward = Vec3::new(floats[2], floats[6], floats[10]);
        let colour = [
            channel(forward.x),
            channel(forward.y),
            channel(forward.z),
            255,
        ];
        device.fill_texture(back_buffer, colour)?;
        Ok(())
    })
}

fn channel(value: f32) -> u8 {
    ((value * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0) as u8
}
