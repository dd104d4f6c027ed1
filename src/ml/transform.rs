//! 画像の前処理とデータ拡張
//!
//! テンソル化・リサイズ・左右反転・射影変換の各変換を提供します。

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::{Rng, RngCore};

/// 画像 -> 画像 の変換
pub trait ImageTransform: Send + Sync {
    fn apply(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage;
}

/// 複数の変換を順番に適用
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn ImageTransform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transform: impl ImageTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl ImageTransform for Compose {
    fn apply(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage {
        self.transforms
            .iter()
            .fold(image, |image, transform| transform.apply(image, rng))
    }
}

/// 正方形へのリサイズ
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    pub size: u32,
}

impl Resize {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl ImageTransform for Resize {
    fn apply(&self, image: RgbImage, _rng: &mut dyn RngCore) -> RgbImage {
        if image.width() == self.size && image.height() == self.size {
            return image;
        }
        imageops::resize(&image, self.size, self.size, FilterType::Triangle)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RandomHorizontalFlip {
    pub p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Self {
        Self { p }
    }
}

impl ImageTransform for RandomHorizontalFlip {
    fn apply(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage {
        if rng.gen_bool(self.p) {
            imageops::flip_horizontal(&image)
        } else {
            image
        }
    }
}

/// 四隅をランダムにずらした射影変換
///
/// 各隅は辺の半分 × `distortion_scale` の範囲で内側へ移動する。
/// 元画像の外側を参照した画素は黒で埋める。
#[derive(Debug, Clone, Copy)]
pub struct RandomPerspective {
    pub distortion_scale: f64,
    pub p: f64,
}

impl RandomPerspective {
    pub fn new(distortion_scale: f64, p: f64) -> Self {
        Self { distortion_scale, p }
    }

    fn endpoints(&self, width: u32, height: u32, rng: &mut dyn RngCore) -> [(f64, f64); 4] {
        let dx = (self.distortion_scale * (width / 2) as f64) as u32;
        let dy = (self.distortion_scale * (height / 2) as f64) as u32;
        let right = width.saturating_sub(1);
        let bottom = height.saturating_sub(1);

        let top_left = (rng.gen_range(0..=dx), rng.gen_range(0..=dy));
        let top_right = (rng.gen_range(right.saturating_sub(dx)..=right), rng.gen_range(0..=dy));
        let bottom_right = (
            rng.gen_range(right.saturating_sub(dx)..=right),
            rng.gen_range(bottom.saturating_sub(dy)..=bottom),
        );
        let bottom_left = (
            rng.gen_range(0..=dx),
            rng.gen_range(bottom.saturating_sub(dy)..=bottom),
        );

        [top_left, top_right, bottom_right, bottom_left].map(|(x, y)| (x as f64, y as f64))
    }
}

impl ImageTransform for RandomPerspective {
    fn apply(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage {
        if !rng.gen_bool(self.p) {
            return image;
        }
        let start = corners(image.width(), image.height());
        let end = self.endpoints(image.width(), image.height(), rng);
        perspective(&image, &start, &end)
    }
}

fn corners(width: u32, height: u32) -> [(f64, f64); 4] {
    let right = width.saturating_sub(1) as f64;
    let bottom = height.saturating_sub(1) as f64;
    [(0.0, 0.0), (right, 0.0), (right, bottom), (0.0, bottom)]
}

/// `start` の四隅が `end` に移るように画像を射影変換
pub fn perspective(image: &RgbImage, start: &[(f64, f64); 4], end: &[(f64, f64); 4]) -> RgbImage {
    // 出力座標 -> 入力座標 の係数を求めて逆写像でサンプリングする
    let Some(coeffs) = perspective_coeffs(end, start) else {
        return image.clone();
    };
    let [a, b, c, d, e, f, g, h] = coeffs;

    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let (x, y) = (x as f64, y as f64);
        let denominator = g * x + h * y + 1.0;
        if denominator.abs() < f64::EPSILON {
            return Rgb([0, 0, 0]);
        }
        let u = (a * x + b * y + c) / denominator;
        let v = (d * x + e * y + f) / denominator;
        sample_bilinear(image, u, v)
    })
}

/// (x, y) -> ((ax + by + c) / (gx + hy + 1), (dx + ey + f) / (gx + hy + 1))
/// となる係数 [a, b, c, d, e, f, g, h] を4点の対応から求める
fn perspective_coeffs(from: &[(f64, f64); 4], to: &[(f64, f64); 4]) -> Option<[f64; 8]> {
    let mut matrix = [[0.0f64; 9]; 8];

    for (i, (&(x, y), &(u, v))) in from.iter().zip(to.iter()).enumerate() {
        matrix[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
        matrix[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
    }

    // 部分ピボット付きガウスの消去法
    for col in 0..8 {
        let pivot =
            (col..8).max_by(|&l, &r| matrix[l][col].abs().total_cmp(&matrix[r][col].abs()))?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);

        for row in 0..8 {
            if row == col {
                continue;
            }
            let factor = matrix[row][col] / matrix[col][col];
            for k in col..9 {
                matrix[row][k] -= factor * matrix[col][k];
            }
        }
    }

    let mut coeffs = [0.0; 8];
    for (i, coeff) in coeffs.iter_mut().enumerate() {
        *coeff = matrix[i][8] / matrix[i][i];
    }
    Some(coeffs)
}

fn sample_bilinear(image: &RgbImage, u: f64, v: f64) -> Rgb<u8> {
    let max_x = image.width().saturating_sub(1) as f64;
    let max_y = image.height().saturating_sub(1) as f64;
    // 浮動小数点誤差の分だけ範囲を広げる
    if !(-1e-6..=max_x + 1e-6).contains(&u) || !(-1e-6..=max_y + 1e-6).contains(&v) {
        return Rgb([0, 0, 0]);
    }

    let u = u.clamp(0.0, max_x);
    let v = v.clamp(0.0, max_y);
    let x0 = u.floor();
    let y0 = v.floor();
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);
    let fx = u - x0;
    let fy = v - y0;

    let p00 = image.get_pixel(x0 as u32, y0 as u32);
    let p10 = image.get_pixel(x1 as u32, y0 as u32);
    let p01 = image.get_pixel(x0 as u32, y1 as u32);
    let p11 = image.get_pixel(x1 as u32, y1 as u32);

    let mut out = [0u8; 3];
    for (channel, value) in out.iter_mut().enumerate() {
        let top = p00[channel] as f64 * (1.0 - fx) + p10[channel] as f64 * fx;
        let bottom = p01[channel] as f64 * (1.0 - fx) + p11[channel] as f64 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// ToTensor: (H, W, C) の u8 画像を (C, H, W) 順の [0, 1] の値に変換
pub fn to_tensor_data(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(image.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 10) as u8, (y * 10) as u8, ((x + y) * 5) as u8])
        })
    }

    #[test]
    fn test_to_tensor_layout() {
        let image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 255, 0])
            }
        });
        let data = to_tensor_data(&image);
        // R平面, G平面, B平面の順
        assert_eq!(data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_flip_twice_is_identity() {
        let image = gradient_image(7, 5);
        let flip = RandomHorizontalFlip::new(1.0);
        let mut rng = StdRng::seed_from_u64(0);

        let flipped = flip.apply(image.clone(), &mut rng);
        assert_ne!(flipped, image);
        assert_eq!(flip.apply(flipped, &mut rng), image);
    }

    #[test]
    fn test_zero_probability_keeps_image() {
        let image = gradient_image(8, 8);
        let mut rng = StdRng::seed_from_u64(1);
        let augment = Compose::new()
            .with(RandomHorizontalFlip::new(0.0))
            .with(RandomPerspective::new(0.5, 0.0));

        assert_eq!(augment.apply(image.clone(), &mut rng), image);
    }

    #[test]
    fn test_identity_perspective() {
        let image = gradient_image(9, 6);
        let points = corners(9, 6);
        assert_eq!(perspective(&image, &points, &points), image);
    }

    #[test]
    fn test_perspective_keeps_size_and_blacks_out_corners() {
        let image = RgbImage::from_pixel(16, 16, Rgb([200, 200, 200]));
        let start = corners(16, 16);
        let end = [(4.0, 4.0), (11.0, 4.0), (11.0, 11.0), (4.0, 11.0)];

        let warped = perspective(&image, &start, &end);
        assert_eq!(warped.dimensions(), (16, 16));
        assert_eq!(warped.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(warped.get_pixel(8, 8), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_random_perspective_endpoints_in_bounds() {
        let transform = RandomPerspective::new(0.5, 1.0);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            for (x, y) in transform.endpoints(224, 224, &mut rng) {
                assert!((0.0..=223.0).contains(&x));
                assert!((0.0..=223.0).contains(&y));
            }
        }
    }

    #[test]
    fn test_resize() {
        let mut rng = StdRng::seed_from_u64(0);
        let resized = Resize::new(32).apply(gradient_image(50, 40), &mut rng);
        assert_eq!(resized.dimensions(), (32, 32));
    }
}
