//! Fixed pool of worker names for count-based selection.

/// Names handed out, in order, when workers are requested by count.
pub const DEFAULT_NAMES: &[&str] = &[
    "alice", "bob", "charlie", "diana", "edward", "fiona", "george", "hannah",
    "ian", "julia", "kevin", "luna", "marcus", "nina", "owen", "petra", "quincy",
    "ruby", "simon", "tessa", "ulrich", "vera", "winston", "xara", "yuki", "zoe",
    "adrian", "bianca", "carlos", "delphine", "ethan", "freya", "gabriel", "hazel",
    "iris", "jasper", "kira", "liam", "maya", "noah", "olive", "phoenix", "quinn",
    "river", "sage", "theo", "uma", "violet", "willow", "xander", "yasmin", "zane",
    "aria", "blake", "cleo", "dante", "ember", "felix", "gemma", "hugo", "indigo",
    "jade", "kai", "leo", "mira", "nora", "orion", "piper", "quest", "raven",
    "stella", "tyler", "unity", "vance", "wren", "xavi", "yara", "zara", "atlas",
    "brooke", "cruz", "dove", "elena", "finn", "grace", "hunter", "ivy", "jude",
    "knox", "lyra", "milo", "neve", "oslo", "penny", "quill", "rose", "sky",
    "terra", "ula", "vega", "wave", "xyla", "york", "zion",
];

/// The first `count` default names, or `None` if the pool is too small.
pub fn default_names(count: usize) -> Option<&'static [&'static str]> {
    DEFAULT_NAMES.get(..count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pool_is_unique() {
        let unique: HashSet<_> = DEFAULT_NAMES.iter().collect();
        assert_eq!(unique.len(), DEFAULT_NAMES.len());
    }

    #[test]
    fn first_names_are_stable() {
        assert_eq!(default_names(3), Some(&["alice", "bob", "charlie"][..]));
        assert_eq!(default_names(0), Some(&[][..]));
    }

    #[test]
    fn oversized_request_is_none() {
        assert!(default_names(DEFAULT_NAMES.len() + 1).is_none());
    }
}
