fn main() {
    // Shaders are compiled at startup, but a change should still relink the binary
    println!("cargo:rerun-if-changed=shaders");

    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    configure_msvc_shaderc();
}

// shaderc is built from source; its CRT and the C++ runtime must match Rust's
// dynamic (/MD) linkage on MSVC.
#[cfg(all(target_os = "windows", target_env = "msvc"))]
fn configure_msvc_shaderc() {
    std::env::set_var("CXXFLAGS", "/MD");
    std::env::set_var("CFLAGS", "/MD");
    std::env::set_var("CMAKE_CXX_FLAGS_RELEASE", "/MD /O2 /Ob2 /DNDEBUG");
    std::env::set_var("CMAKE_C_FLAGS_RELEASE", "/MD /O2 /Ob2 /DNDEBUG");

    for lib in ["legacy_stdio_definitions", "oldnames", "msvcprt"] {
        println!("cargo:rustc-link-lib={}", lib);
    }
}
