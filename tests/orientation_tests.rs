use edgeview::display::quad::{QUAD_POSITIONS, QUAD_TEX_COORDS};
use edgeview::display::Quad;
use edgeview::orientation::{resolve, OrientationState};
use edgeview::{DisplayRotation, Rotation};
use proptest::prelude::*;

fn display_rotation() -> impl Strategy<Value = DisplayRotation> {
    prop::sample::select(DisplayRotation::ALL.to_vec())
}

proptest! {
    #[test]
    fn test_resolve_lands_on_quarter_turn(
        sensor in prop::sample::select(vec![0, 90, 180, 270]),
        display in display_rotation(),
    ) {
        let total = resolve(sensor, display).degrees();
        prop_assert!([0, 90, 180, 270].contains(&total));
        prop_assert_eq!(total, (sensor - display.degrees() + 360) % 360);
    }

    #[test]
    fn test_resolve_is_periodic(sensor in -1080i32..1080, display in display_rotation()) {
        prop_assert_eq!(resolve(sensor, display), resolve(sensor + 360, display));
    }

    #[test]
    fn test_display_change_recomputes_total(
        sensor in prop::sample::select(vec![0, 90, 180, 270]),
        first in display_rotation(),
        second in display_rotation(),
    ) {
        let state = OrientationState::new(sensor, first).with_display(second);
        prop_assert_eq!(state.total, resolve(sensor, second));
        prop_assert_eq!(state.sensor_mount_angle, sensor);
    }

    #[test]
    fn test_rotated_tex_coords_permute_corners(turns in 0usize..4) {
        let rotations = [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270];
        let quad = Quad::full_screen(rotations[turns]);
        let mut rotated = quad.tex_coords.to_vec();
        let mut corners = QUAD_TEX_COORDS.to_vec();
        rotated.sort_by(|a, b| a.partial_cmp(b).unwrap());
        corners.sort_by(|a, b| a.partial_cmp(b).unwrap());
        prop_assert_eq!(rotated, corners);
        prop_assert_eq!(quad.positions, QUAD_POSITIONS);
    }
}

#[test]
fn test_back_camera_portrait_needs_quarter_turn() {
    assert_eq!(resolve(90, DisplayRotation::Rotation0), Rotation::Deg90);
}
