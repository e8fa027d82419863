//! Class name tables for YOLOv8 models.

/// Classes of the COCO dataset, in the order the stock `yolov8n` weights predict them.
pub const COCO_CLASS_NAMES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub fn coco_class_names() -> Vec<String> {
    COCO_CLASS_NAMES.iter().map(|name| name.to_string()).collect()
}

/// Parses the `names` metadata entry written by the Ultralytics ONNX exporter,
/// e.g. `{0: 'fire', 1: 'smoke'}`.
///
/// Returns `None` when the text is malformed, empty, or the indices are not `0..n`.
pub fn parse_names_metadata(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;

    let mut entries = Vec::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let (index, tail) = rest.split_once(':')?;
        let index: usize = index.trim().parse().ok()?;

        let tail = tail.trim_start();
        let quote = tail.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let tail = &tail[1..];
        let end = tail.find(quote)?;
        entries.push((index, tail[..end].to_string()));

        rest = tail[end + 1..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }

    if entries.is_empty() {
        return None;
    }

    entries.sort_by_key(|(index, _)| *index);
    if entries
        .iter()
        .enumerate()
        .any(|(position, (index, _))| position != *index)
    {
        return None;
    }

    Some(entries.into_iter().map(|(_, name)| name).collect())
}
