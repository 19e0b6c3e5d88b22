use std::io::Cursor;

use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};

pub const PLACEHOLDER_FILENAME: &str = "no-image.png";

const WIDTH: u32 = 300;
const HEIGHT: u32 = 200;

const BACKGROUND: Rgb<u8> = Rgb([238, 238, 238]);
const FRAME: Rgb<u8> = Rgb([170, 170, 170]);

/// A grey 300x200 PNG with a frame and a diagonal cross. Same bytes on every call.
pub fn render() -> Result<Bytes, image::ImageError> {
	let mut canvas = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);

	for (x, y, pixel) in canvas.enumerate_pixels_mut() {
		let on_frame = x < 4 || y < 4 || x >= WIDTH - 4 || y >= HEIGHT - 4;
		// Both diagonals, two pixels thick
		let scaled = x * HEIGHT;
		let on_cross = scaled.abs_diff(y * WIDTH) < 2 * WIDTH
			|| scaled.abs_diff((HEIGHT - 1 - y) * WIDTH) < 2 * WIDTH;

		if on_frame || on_cross {
			*pixel = FRAME;
		}
	}

	let mut encoded = Cursor::new(Vec::new());
	canvas.write_to(&mut encoded, ImageFormat::Png)?;

	Ok(Bytes::from(encoded.into_inner()))
}
