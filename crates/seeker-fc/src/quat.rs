//! Euler (aerospace ZYX, body frame) <-> unit quaternion, in the `[w, x, y, z]`
//! order SET_ATTITUDE_TARGET expects.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub fn from_euler_deg(roll: f32, pitch: f32, yaw: f32) -> Self {
        // f64 keeps the half-angle products exact enough near zero
        let (sr, cr) = (f64::from(roll).to_radians() / 2.0).sin_cos();
        let (sp, cp) = (f64::from(pitch).to_radians() / 2.0).sin_cos();
        let (sy, cy) = (f64::from(yaw).to_radians() / 2.0).sin_cos();

        let w = cr * cp * cy + sr * sp * sy;
        let x = sr * cp * cy - cr * sp * sy;
        let y = cr * sp * cy + sr * cp * sy;
        let z = cr * cp * sy - sr * sp * cy;

        let n = (w * w + x * x + y * y + z * z).sqrt();
        if !n.is_finite() || n == 0.0 {
            return Self::IDENTITY;
        }
        Self { w: (w / n) as f32, x: (x / n) as f32, y: (y / n) as f32, z: (z / n) as f32 }
    }

    /// (roll, pitch, yaw) in degrees.
    pub fn to_euler_deg(&self) -> (f32, f32, f32) {
        let (w, x, y, z) = (f64::from(self.w), f64::from(self.x), f64::from(self.y), f64::from(self.z));
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll.to_degrees() as f32, pitch.to_degrees() as f32, yaw.to_degrees() as f32)
    }

    pub fn norm(&self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.w, self.x, self.y, self.z]
    }
}
