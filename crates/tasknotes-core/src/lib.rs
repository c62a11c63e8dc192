//! Core library for tasknotes: workspace discovery, frontmatter editing,
//! id allocation and the record store.

pub mod config;
pub mod frontmatter;
pub mod id_alloc;
pub mod record;
pub mod store;
pub mod template;
pub mod workspace;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
