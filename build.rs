use std::{env, path::PathBuf, process::Command};

fn main() {
    println!("cargo::rustc-check-cfg=cfg(cuda_backend)");
    println!("cargo:rerun-if-changed=src/cuda");

    let target = std::env::var("TARGET").unwrap();
    let cuda_feature = env::var_os("CARGO_FEATURE_CUDA").is_some();

    if !cuda_feature && !target.contains("aarch64-unknown-linux") {
        println!("cargo:warning=Building without CUDA runtime (host emulation only)");
        return;
    }

    println!("cargo:rustc-cfg=cuda_backend");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    //
    // ---- Target architecture ----
    //
    // Jetson Orin by default, overridable for desktop GPUs.
    let arch = env::var("DEVICE_CAMERA_CUDA_ARCH").unwrap_or_else(|_| "87".to_string());
    println!("cargo:rerun-if-env-changed=DEVICE_CAMERA_CUDA_ARCH");

    //
    // ---- Compile each .cu file into PTX ----
    //
    let kernels = ["src/cuda/kernels/device_camera.cu"];

    for kernel in kernels {
        let kpath = PathBuf::from(kernel);
        let name = kpath.file_stem().unwrap().to_str().unwrap();
        let ptx_file = out_dir.join(format!("{name}.ptx"));

        println!("cargo:warning=Compiling {kernel} → {name}.ptx");

        let status = Command::new("nvcc")
            .arg("-ptx")
            .arg("-o")
            .arg(&ptx_file)
            .arg(&kpath)
            .arg(format!("-arch=compute_{arch}"))
            .arg(format!("-code=sm_{arch}"))
            .status()
            .expect("Failed to run nvcc");

        assert!(status.success(), "Failed to compile {kernel} to PTX");
    }
}
