// build.rs
fn main() {
    // Link Apple Accelerate when the feature is enabled
    let accelerate = std::env::var_os("CARGO_FEATURE_BLAS_ACCELERATE").is_some();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if accelerate && target_os == "macos" {
        // Provides cblas_* symbols on macOS
        println!("cargo:rustc-link-lib=framework=Accelerate");
    }
}
