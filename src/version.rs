/// Version string produced by `git describe` at build time (see build.rs).
pub const VERSION: &str = env!("GIT_TAG");
