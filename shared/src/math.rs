use crate::codec::{Serializable, Serializer};
use crate::error::CodecError;

///Represents a vector in 3D space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        self.dot(self).sqrt()
    }

    ///Returns the normalized vector, or zero for a zero-length vector.
    pub fn normalize(&self) -> Vec3 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vec3::ZERO
        } else {
            self.scale(1.0 / mag)
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vec3 {
        Vec3::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }

    ///Returns the sum of two vectors.
    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn dot(&self, other: &Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        self.sub(other).magnitude()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Clamps the magnitude to `max`, keeping the direction.
    pub fn clamp_magnitude(&self, max: f32) -> Vec3 {
        let mag = self.magnitude();
        if mag > max {
            self.normalize().scale(max)
        } else {
            *self
        }
    }
}

impl Serializable for Vec3 {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.f32(&mut self.x)?;
        s.f32(&mut self.y)?;
        s.f32(&mut self.z)
    }
}

/// Unit quaternion orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn normalize(&self) -> Quat {
        let len = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
        if len == 0.0 {
            Quat::IDENTITY
        } else {
            Quat {
                x: self.x / len,
                y: self.y / len,
                z: self.z / len,
                w: self.w / len,
            }
        }
    }

    pub fn mul(&self, other: &Quat) -> Quat {
        Quat {
            w: self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            x: self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            y: self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            z: self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        }
    }

    /// Advances the orientation by an angular velocity (radians per second) over `dt`.
    pub fn integrate(&self, angular_velocity: &Vec3, dt: f32) -> Quat {
        let spin = Quat {
            x: angular_velocity.x,
            y: angular_velocity.y,
            z: angular_velocity.z,
            w: 0.0,
        }
        .mul(self);

        Quat {
            x: self.x + 0.5 * dt * spin.x,
            y: self.y + 0.5 * dt * spin.y,
            z: self.z + 0.5 * dt * spin.z,
            w: self.w + 0.5 * dt * spin.w,
        }
        .normalize()
    }
}

impl Serializable for Quat {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.f32(&mut self.x)?;
        s.f32(&mut self.y)?;
        s.f32(&mut self.z)?;
        s.f32(&mut self.w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_vector_magnitude_and_normalize() {
        let v = Vec3::new(3.0, 4.0, 0.0);
        assert_approx_eq!(v.magnitude(), 5.0, 1e-6);

        let n = v.normalize();
        assert_approx_eq!(n.magnitude(), 1.0, 1e-6);
        assert_eq!(Vec3::ZERO.normalize(), Vec3::ZERO);
    }

    #[test]
    fn test_clamp_magnitude() {
        let v = Vec3::new(0.0, 10.0, 0.0).clamp_magnitude(2.0);
        assert_approx_eq!(v.y, 2.0, 1e-6);

        let small = Vec3::new(0.5, 0.0, 0.0);
        assert_eq!(small.clamp_magnitude(2.0), small);
    }

    #[test]
    fn test_integrate_stays_unit_length() {
        let mut q = Quat::IDENTITY;
        let spin = Vec3::new(0.0, 1.5, 0.2);
        for _ in 0..600 {
            q = q.integrate(&spin, 1.0 / 60.0);
        }
        let len = (q.x * q.x + q.y * q.y + q.z * q.z + q.w * q.w).sqrt();
        assert_approx_eq!(len, 1.0, 1e-5);
        assert_ne!(q, Quat::IDENTITY);
    }

    #[test]
    fn test_zero_spin_keeps_orientation() {
        let q = Quat::IDENTITY.integrate(&Vec3::ZERO, 0.5);
        assert_eq!(q, Quat::IDENTITY);
    }
}
