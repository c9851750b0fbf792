use std::{path::PathBuf, sync::LazyLock};

pub static DEFAULT_CONFIG_PATH: LazyLock<PathBuf> = LazyLock::new(|| {
    if let Some(dir) = std::env::var_os("JACKIFY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    let mut path = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_default();
    path.push("jackify");
    path
});

/// Computes the path from the Jackify config directory based on the arguments.
///
/// Returns a `&Path` referencing the config directory itself if no arguments are passed in, or a
/// `PathBuf` created by joining all of the arguments to the base config directory if at least
/// one argument is passed in.
///
/// # Examples
///
/// ```
/// use jackify_rust::config_path;
///
/// // With JACKIFY_CONFIG_DIR unset this is ~/.config/jackify
/// let base = config_path!().to_path_buf();
/// assert_eq!(config_path!("logs", "a.log"), base.join("logs").join("a.log"));
/// ```
#[macro_export]
macro_rules! config_path {
    () => {
        $crate::paths::DEFAULT_CONFIG_PATH.as_path()
    };

    ( $( $path:expr ),+ $(,)? ) => {
        [
            $crate::paths::DEFAULT_CONFIG_PATH.as_path(),
            $( std::path::Path::new(&$path) ),+
        ].into_iter().collect::<std::path::PathBuf>()
    };
}
