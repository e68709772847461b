/// Helpers for `#[serde(default = "...")]` attributes, which only accept paths.
pub struct Bool;

impl Bool {
    pub fn r#true() -> bool {
        true
    }

    pub fn r#false() -> bool {
        false
    }
}
