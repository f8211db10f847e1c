//! Base resources seeded into a generation at install time

/// Placeholder replaced by the build label in configured resource paths
pub const BUILD_PLACEHOLDER: &str = "{build}";

/// Default seed list for a build: the app shell plus the versioned bundles
pub fn default_base_resources(build: &str) -> Vec<String> {
    vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        format!("/scripts_{}.js", build),
        format!("/styles_{}.css", build),
        format!("/websocket_{}.js", build),
    ]
}

/// Expand a configured seed list for a build
///
/// An empty list selects the defaults.
pub fn expand_base_resources(configured: &[String], build: &str) -> Vec<String> {
    if configured.is_empty() {
        return default_base_resources(build);
    }

    configured
        .iter()
        .map(|path| path.replace(BUILD_PLACEHOLDER, build))
        .collect()
}
