fn main() {
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    #[cfg(feature = "cuda")]
    generate_bindings();
}

#[cfg(feature = "cuda")]
fn generate_bindings() {
    use std::env;
    use std::path::PathBuf;

    let cuda_path = env::var("CUDA_PATH").unwrap_or("/usr/local/cuda".to_string());

    let cuda_lib_path = format!("{}/lib64", cuda_path);
    let cuda_header_path = format!("{}/include", cuda_path);
    let cuda_runtime_header_path = format!("{}/include/cuda_runtime.h", cuda_path);

    println!("cargo:rustc-link-search={}", cuda_lib_path);
    println!("cargo:rustc-link-lib=dylib=cudart");

    // only the runtime API is used: memory, streams, events, device queries
    let bindings = bindgen::Builder::default()
        .header(cuda_runtime_header_path)
        .clang_arg(format!("-I{}", cuda_header_path))
        .allowlist_function("cuda.*")
        .allowlist_type("cuda.*")
        .allowlist_var("cuda.*")
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate()
        .expect("Unable to generate CUDA runtime bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap()).join("bindings.rs");
    bindings
        .write_to_file(out_path)
        .expect("Couldn't write bindings!");
}
