// Mirrors the core crate's toggle so the `fnv` subcommand exists exactly
// when the core crate exports the hash entry point.
fn main() {
    println!("cargo:rerun-if-env-changed=WARREN_TEST_FNV");
    println!("cargo:rustc-check-cfg=cfg(warren_test_fnv)");
    let toggle = std::env::var("WARREN_TEST_FNV").unwrap_or_default();
    if !toggle.is_empty() && toggle != "0" {
        println!("cargo:rustc-cfg=warren_test_fnv");
    }
}
