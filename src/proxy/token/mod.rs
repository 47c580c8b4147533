pub mod hybrid;
pub mod pool;
pub mod rate;
pub mod selection;

pub use pool::{AccountPool, SlotGuard};
pub use rate::{CooldownTracker, LimitType};
pub use selection::{
    build_selector, AccountSelector, RoundRobinSelector, SelectCtx, Selection, StickySelector,
};

// Composite rate-limit key: the model id, qualified by the quota class when
// one applies. The same account holds independent limits per class.
pub fn quota_key(model: &str, quota_class: Option<&str>) -> String {
    match quota_class {
        Some(class) if !class.is_empty() => format!("{}:{}", model, class),
        _ => model.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_key_includes_class_when_present() {
        assert_eq!(quota_key("gemini-3-flash", Some("cli")), "gemini-3-flash:cli");
        assert_eq!(quota_key("gemini-3-flash", None), "gemini-3-flash");
        assert_eq!(quota_key("gemini-3-flash", Some("")), "gemini-3-flash");
    }
}
