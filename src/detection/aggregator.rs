use crate::detection::types::{Detection, DetectionSummary};

pub fn aggregate(detections: &[Detection]) -> DetectionSummary {
    let mut summary = DetectionSummary::default();
    for detection in detections {
        summary.record(&detection.class_name);
    }
    summary
}

/// One `class = count` line per class, first-seen order.
pub fn format(summary: &DetectionSummary) -> String {
    summary
        .iter()
        .map(|(class_name, count)| format!("{class_name} = {count}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_name: &str) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            center_x: 0.5,
            center_y: 0.5,
            width: 0.1,
            height: 0.1,
        }
    }

    #[test]
    fn counts_sum_to_number_of_detections() {
        let inputs: Vec<Vec<Detection>> = vec![
            vec![],
            vec![det("dog")],
            vec![det("dog"), det("cat"), det("dog")],
            ["a", "b", "c", "a", "b", "a", "d"].iter().map(|c| det(c)).collect(),
        ];
        for detections in inputs {
            let summary = aggregate(&detections);
            assert_eq!(summary.total(), detections.len());
            assert!(summary.iter().all(|(_, count)| count > 0));
        }
    }

    #[test]
    fn preserves_first_seen_order() {
        let summary = aggregate(&[det("person"), det("car"), det("person"), det("bus"), det("car")]);
        let order: Vec<_> = summary.iter().collect();
        assert_eq!(order, [("person", 2), ("car", 2), ("bus", 1)]);
        assert_eq!(summary.get("bus"), Some(1));
        assert_eq!(summary.get("truck"), None);
    }

    #[test]
    fn formats_one_line_per_class() {
        let summary = aggregate(&[det("dog"), det("dog"), det("cat")]);
        assert_eq!(format(&summary), "dog = 2\ncat = 1");
    }

    #[test]
    fn empty_summary_formats_to_empty_string() {
        let summary = aggregate(&[]);
        assert!(summary.is_empty());
        assert_eq!(format(&summary), "");
    }
}
