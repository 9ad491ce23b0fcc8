use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::geometry::{bbox_anchor, BBox, Point};

/// One object in one frame, as reported by the upstream detector/tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    pub confidence: f64,
    pub tracker_id: u32,
}

impl Detection {
    pub fn anchor(&self) -> Point {
        bbox_anchor(&self.bbox)
    }

    pub fn vehicle_type(&self) -> Option<VehicleType> {
        VehicleType::from_class_id(self.class_id)
    }
}

/// Track identifier that survives short upstream id reassignments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Road users counted by the engine, keyed by COCO class id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleType {
    pub const ALL: &[VehicleType] = &[
        VehicleType::Bicycle,
        VehicleType::Car,
        VehicleType::Motorcycle,
        VehicleType::Bus,
        VehicleType::Truck,
    ];

    pub fn from_class_id(class_id: u32) -> Option<Self> {
        match class_id {
            1 => Some(VehicleType::Bicycle),
            2 => Some(VehicleType::Car),
            3 => Some(VehicleType::Motorcycle),
            5 => Some(VehicleType::Bus),
            7 => Some(VehicleType::Truck),
            _ => None,
        }
    }

    pub fn class_id(self) -> u32 {
        match self {
            VehicleType::Bicycle => 1,
            VehicleType::Car => 2,
            VehicleType::Motorcycle => 3,
            VehicleType::Bus => 5,
            VehicleType::Truck => 7,
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleType::Bicycle => write!(f, "bicycle"),
            VehicleType::Car => write!(f, "car"),
            VehicleType::Motorcycle => write!(f, "motorcycle"),
            VehicleType::Bus => write!(f, "bus"),
            VehicleType::Truck => write!(f, "truck"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Some(VehicleType::Bicycle))]
    #[case(2, Some(VehicleType::Car))]
    #[case(3, Some(VehicleType::Motorcycle))]
    #[case(5, Some(VehicleType::Bus))]
    #[case(7, Some(VehicleType::Truck))]
    #[case::person(0, None)]
    #[case::train(6, None)]
    fn test_class_mapping(#[case] class_id: u32, #[case] expected: Option<VehicleType>) {
        assert_eq!(VehicleType::from_class_id(class_id), expected);
    }

    #[test]
    fn test_class_id_round_trips_for_all_types() {
        for vt in VehicleType::ALL {
            assert_eq!(VehicleType::from_class_id(vt.class_id()), Some(*vt));
        }
    }

    #[test]
    fn test_detection_deserializes_from_tracker_output() {
        let json = r#"{"bbox":[0,0,10,20],"class_id":2,"confidence":0.9,"tracker_id":4}"#;
        let det: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(det.vehicle_type(), Some(VehicleType::Car));
        assert_eq!(det.anchor(), Point::new(5.0, 20.0));
    }

    #[test]
    fn test_track_id_display() {
        assert_eq!(TrackId(12).to_string(), "#12");
    }
}
