use std::f32::consts::PI;

use nalgebra::Point2;

/// Salient image location, equivalent of a detector's keypoint record.
///
/// `size` is the diameter of the meaningful neighbourhood around `point`,
/// `angle` is the dominant orientation in degrees (`[0, 360)`) when the
/// detector computes one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub point: Point2<f32>,
    pub size: f32,
    pub angle: Option<f32>,
    pub response: f32,
    pub octave: i32,
    /// Detector-specific layer id, `-1` when unused
    pub class_id: i32,
}

impl Default for KeyPoint {
    fn default() -> Self {
        Self {
            point: Point2::origin(),
            size: 0.0,
            angle: None,
            response: 0.0,
            octave: 0,
            class_id: -1,
        }
    }
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, size: f32) -> Self {
        Self {
            point: Point2::new(x, y),
            size,
            ..Default::default()
        }
    }

    pub fn with_response(mut self, response: f32) -> Self {
        self.response = response;
        self
    }

    pub fn with_angle(mut self, angle: f32) -> Self {
        self.angle = Some(angle.rem_euclid(360.0));
        self
    }

    pub fn x(&self) -> f32 {
        self.point.x
    }

    pub fn y(&self) -> f32 {
        self.point.y
    }

    /// Orientation in radians, `0` when the keypoint carries none
    pub fn angle_radians(&self) -> f32 {
        self.angle.map(|a| a.to_radians()).unwrap_or(0.0)
    }

    /// Intersection over union of the two keypoint discs.
    ///
    /// When one disc lies completely inside the other the ratio of the smaller
    /// area to the larger one is returned.
    pub fn overlap(a: &KeyPoint, b: &KeyPoint) -> f32 {
        let ra = a.size * 0.5;
        let rb = b.size * 0.5;
        let ra_2 = ra * ra;
        let rb_2 = rb * rb;
        let c = nalgebra::distance(&a.point, &b.point);

        if ra.min(rb) + c <= ra.max(rb) {
            if ra_2.max(rb_2) == 0.0 {
                return 0.0;
            }
            return ra_2.min(rb_2) / ra_2.max(rb_2);
        }

        if c < ra + rb {
            let c_2 = c * c;
            let cos_alpha = ((rb_2 + c_2 - ra_2) / (b.size * c)).clamp(-1.0, 1.0);
            let cos_beta = ((ra_2 + c_2 - rb_2) / (a.size * c)).clamp(-1.0, 1.0);
            let alpha = cos_alpha.acos();
            let beta = cos_beta.acos();

            let segment_a = ra_2 * beta;
            let segment_b = rb_2 * alpha;
            let triangles = ra_2 * beta.sin() * cos_beta + rb_2 * alpha.sin() * cos_alpha;

            let intersection = segment_a + segment_b - triangles;
            let union = (ra_2 + rb_2) * PI - intersection;

            return intersection / union;
        }

        0.0
    }
}

/// Keeps the `n` keypoints with the highest response, in descending order.
pub fn retain_best(keypoints: &mut Vec<KeyPoint>, n: usize) {
    if keypoints.len() <= n {
        return;
    }
    keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
    keypoints.truncate(n);
}

/// Axis aligned rectangle with half-open bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, point: &Point2<f32>) -> bool {
        self.x as f32 <= point.x
            && point.x < (self.x + self.width) as f32
            && self.y as f32 <= point.y
            && point.y < (self.y + self.height) as f32
    }

    /// Keypoints which fall inside the rectangle, order preserved
    pub fn crop(&self, keypoints: Vec<KeyPoint>) -> Vec<KeyPoint> {
        keypoints
            .into_iter()
            .filter(|keypoint| self.contains(&keypoint.point))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_keypoints_do_not_overlap() {
        let a = KeyPoint::new(0.0, 0.0, 6.0);
        let b = KeyPoint::new(6.0, 0.0, 6.0);
        assert_eq!(KeyPoint::overlap(&a, &b), 0.0);
    }

    #[test]
    fn identical_keypoints_fully_overlap() {
        let a = KeyPoint::new(10.0, 10.0, 6.0);
        assert!((KeyPoint::overlap(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nested_keypoints_use_area_ratio() {
        let a = KeyPoint::new(0.0, 0.0, 10.0);
        let b = KeyPoint::new(0.5, 0.0, 4.0);
        let expected = (2.0f32 * 2.0) / (5.0 * 5.0);
        assert!((KeyPoint::overlap(&a, &b) - expected).abs() < 1e-6);
    }

    #[test]
    fn partial_overlap_is_between_zero_and_one() {
        let a = KeyPoint::new(0.0, 0.0, 6.0);
        let b = KeyPoint::new(1.0, 1.0, 6.0);
        let overlap = KeyPoint::overlap(&a, &b);
        assert!(overlap > 0.0 && overlap < 1.0);
        assert!((overlap - KeyPoint::overlap(&b, &a)).abs() < 1e-6);
    }

    #[test]
    fn roi_is_half_open() {
        let roi = Roi::new(535, 180, 180, 150);
        assert!(roi.contains(&Point2::new(535.0, 180.0)));
        assert!(roi.contains(&Point2::new(714.9, 329.9)));
        assert!(!roi.contains(&Point2::new(715.0, 200.0)));
        assert!(!roi.contains(&Point2::new(600.0, 330.0)));
        assert!(!roi.contains(&Point2::new(534.9, 200.0)));
    }

    #[test]
    fn crop_preserves_order() {
        let roi = Roi::new(0, 0, 10, 10);
        let keypoints = vec![
            KeyPoint::new(5.0, 5.0, 1.0),
            KeyPoint::new(50.0, 5.0, 1.0),
            KeyPoint::new(1.0, 9.0, 1.0),
        ];
        let cropped = roi.crop(keypoints);
        assert_eq!(cropped.len(), 2);
        assert_eq!(cropped[0].x(), 5.0);
        assert_eq!(cropped[1].x(), 1.0);
    }

    #[test]
    fn retain_best_keeps_strongest() {
        let mut keypoints = (0..10)
            .map(|i| KeyPoint::new(i as f32, 0.0, 1.0).with_response(i as f32))
            .collect::<Vec<_>>();
        retain_best(&mut keypoints, 3);
        let responses = keypoints.iter().map(|k| k.response).collect::<Vec<_>>();
        assert_eq!(responses, vec![9.0, 8.0, 7.0]);
    }
}
