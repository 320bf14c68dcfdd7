//! Startup banner.

/// Prints the startup banner unless suppressed with `--nospoiler`.
pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r"
             _     _
   __ _ _ __(_) __| | ___ ___  _ __ ___
  / _` | '__| |/ _` |/ __/ _ \| '__/ _ \
 | (_| | |  | | (_| | (_| (_) | | |  __/
  \__, |_|  |_|\__,_|\___\___/|_|  \___|
  |___/
          distributed compute worker
              version {version}
===============================================
"
    );
}
