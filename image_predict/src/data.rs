use std::path::Path;

use burn::tensor::{Data, Shape};
use derive_new::new;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use tracing::debug;

use crate::error::{PredictError, Result};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub trait ImagePreprocessor {
    fn process(&self, image_path: &Path) -> Result<Data<f32, 3>>;
}

#[derive(Debug, Clone, new)]
pub struct ImageNetPreprocessor {
    resize: u32,
    crop: u32,
}

impl Default for ImageNetPreprocessor {
    fn default() -> Self {
        Self::new(256, 224)
    }
}

impl ImageNetPreprocessor {
    pub fn output_shape(&self) -> [usize; 3] {
        [3, self.crop as usize, self.crop as usize]
    }

    pub fn process_image(&self, image: &DynamicImage) -> std::result::Result<Data<f32, 3>, String> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(format!("image has no pixels ({width}x{height})"));
        }

        // shortest side to `resize`, keeping the aspect ratio
        let shortest = self.resize.max(self.crop);
        let (resized_width, resized_height) = if width <= height {
            (shortest, scale(height, shortest, width)?)
        } else {
            (scale(width, shortest, height)?, shortest)
        };
        let resized = image.resize_exact(resized_width, resized_height, FilterType::Triangle);

        let left = (resized_width - self.crop) / 2;
        let top = (resized_height - self.crop) / 2;
        let cropped = resized.crop_imm(left, top, self.crop, self.crop).to_rgb8();

        let size = self.crop as usize;
        let plane = size * size;
        let mut values = vec![0f32; 3 * plane];
        for (x, y, pixel) in cropped.enumerate_pixels() {
            let offset = y as usize * size + x as usize;
            for channel in 0..3 {
                let value = pixel.0[channel] as f32 / 255.0;
                values[channel * plane + offset] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
            }
        }
        debug!("resized {width}x{height} to {resized_width}x{resized_height}, cropped {size}x{size}");

        Ok(Data::new(values, Shape::new(self.output_shape())))
    }
}

fn scale(side: u32, target: u32, reference: u32) -> std::result::Result<u32, String> {
    let scaled = (side as u64 * target as u64 / reference as u64).max(target as u64);
    u32::try_from(scaled).map_err(|_| format!("aspect ratio {side}:{reference} is too extreme to resize"))
}

impl ImagePreprocessor for ImageNetPreprocessor {
    fn process(&self, image_path: &Path) -> Result<Data<f32, 3>> {
        let image = image::open(image_path)
            .map_err(|err| PredictError::image_preprocessing(image_path, err.to_string()))?;
        self.process_image(&image)
            .map_err(|reason| PredictError::image_preprocessing(image_path, reason))
    }
}
