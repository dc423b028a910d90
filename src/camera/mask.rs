use serde::{Deserialize, Serialize};

/// Number of scalar parameters preceding the distortion coefficients in the
/// canonical ordering (location 3, viewdir 3, focal length 2, principal point 2).
pub const FIXED_PARAMETER_COUNT: usize = 10;

/// Selects the scalar camera parameters a calibration is allowed to adjust.
///
/// Flags follow the canonical ordering
/// `location[3], viewdir[3], focal_length[2], principal_point[2], distortion[k]`,
/// matching [`crate::camera::Camera::parameter_vector`]. Location flags are
/// conventionally left unset: camera positions are surveyed, not estimated.
///
/// # Examples
///
/// ```rust
/// use glacier_flow::camera::FreeParameterMask;
///
/// let mask = FreeParameterMask::rotation_only(1);
/// assert_eq!(mask.free_count(), 3);
/// assert_eq!(mask.flags().len(), 11);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeParameterMask {
    pub location: [bool; 3],
    pub viewdir: [bool; 3],
    pub focal_length: [bool; 2],
    pub principal_point: [bool; 2],
    pub distortion: Vec<bool>,
}

impl FreeParameterMask {
    /// Every parameter held fixed.
    pub fn none(distortion_terms: usize) -> Self {
        FreeParameterMask {
            location: [false; 3],
            viewdir: [false; 3],
            focal_length: [false; 2],
            principal_point: [false; 2],
            distortion: vec![false; distortion_terms],
        }
    }

    /// Only yaw, pitch and roll are free.
    pub fn rotation_only(distortion_terms: usize) -> Self {
        FreeParameterMask {
            viewdir: [true; 3],
            ..Self::none(distortion_terms)
        }
    }

    /// View direction, both focal lengths and the first distortion coefficient.
    pub fn view_focal_k1(distortion_terms: usize) -> Self {
        let mut distortion = vec![false; distortion_terms];
        if let Some(first) = distortion.first_mut() {
            *first = true;
        }
        FreeParameterMask {
            viewdir: [true; 3],
            focal_length: [true; 2],
            distortion,
            ..Self::none(distortion_terms)
        }
    }

    /// Everything except the camera location.
    pub fn all_but_location(distortion_terms: usize) -> Self {
        FreeParameterMask {
            location: [false; 3],
            viewdir: [true; 3],
            focal_length: [true; 2],
            principal_point: [true; 2],
            distortion: vec![true; distortion_terms],
        }
    }

    /// Flat flags in canonical order.
    pub fn flags(&self) -> Vec<bool> {
        let mut flags = Vec::with_capacity(self.parameter_count());
        flags.extend_from_slice(&self.location);
        flags.extend_from_slice(&self.viewdir);
        flags.extend_from_slice(&self.focal_length);
        flags.extend_from_slice(&self.principal_point);
        flags.extend_from_slice(&self.distortion);
        flags
    }

    /// Canonical indices of the free parameters, in order.
    pub fn free_indices(&self) -> Vec<usize> {
        self.flags()
            .into_iter()
            .enumerate()
            .filter_map(|(i, free)| free.then_some(i))
            .collect()
    }

    pub fn free_count(&self) -> usize {
        self.flags().into_iter().filter(|free| *free).count()
    }

    pub fn parameter_count(&self) -> usize {
        FIXED_PARAMETER_COUNT + self.distortion.len()
    }

    pub fn all_fixed(&self) -> bool {
        self.free_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_ordering() {
        let mask = FreeParameterMask::view_focal_k1(2);
        assert_eq!(
            mask.flags(),
            vec![
                false, false, false, true, true, true, true, true, false, false, true, false
            ]
        );
        assert_eq!(mask.free_indices(), vec![3, 4, 5, 6, 7, 10]);
        assert_eq!(mask.free_count(), 6);
    }

    #[test]
    fn test_rotation_only_leaves_intrinsics_fixed() {
        let mask = FreeParameterMask::rotation_only(3);
        assert_eq!(mask.free_indices(), vec![3, 4, 5]);
        assert_eq!(mask.parameter_count(), 13);
        assert!(!FreeParameterMask::none(1).flags().contains(&true));
        assert!(FreeParameterMask::none(1).all_fixed());
    }

    #[test]
    fn test_mask_from_yaml() {
        let yaml = "location: [false, false, false]\n\
                    viewdir: [true, true, false]\n\
                    focal_length: [true, true]\n\
                    principal_point: [false, false]\n\
                    distortion: [true]\n";
        let mask: FreeParameterMask = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(mask.free_indices(), vec![3, 4, 6, 7, 10]);
    }
}
