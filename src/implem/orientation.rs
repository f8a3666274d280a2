use image::imageops;
use image::RgbImage;

use crate::model::settings::Rotation;

/// Rotates a decoded frame clockwise by `rotation`. Quarter turns swap the
/// frame's width and height.
pub fn apply(frame: RgbImage, rotation: Rotation) -> RgbImage {
	match rotation {
		Rotation::Normal => frame,
		Rotation::Clockwise90 => imageops::rotate90(&frame),
		Rotation::UpsideDown => imageops::rotate180(&frame),
		Rotation::Anticlockwise90 => imageops::rotate270(&frame),
	}
}
