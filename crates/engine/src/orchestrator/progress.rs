//! Coarse progress estimation from script output.

const MILESTONES: &[(&str, u8)] = &[
    ("start", 10),
    ("navigat", 30),
    ("click", 50),
    ("fill", 70),
    ("finish", 100),
];

/// Highest milestone mentioned in `message`, if any.
pub fn milestone(message: &str) -> Option<u8> {
    let lowered = message.to_lowercase();
    MILESTONES
        .iter()
        .filter(|(word, _)| lowered.contains(word))
        .map(|(_, value)| *value)
        .max()
}
