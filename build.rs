extern crate bindgen;
extern crate cc;

use std::env;
use std::path::PathBuf;
use std::process::Command;

use bindgen::callbacks::{DeriveInfo, ParseCallbacks};

/// 只有无填充的结构体才能按字节查看
#[derive(Debug)]
struct PodTypes;

impl ParseCallbacks for PodTypes {
    fn add_derives(&self, info: &DeriveInfo<'_>) -> Vec<String> {
        match info.name {
            "fb_bitfield" | "fb_var_screeninfo" => {
                vec!["bytemuck::Pod".into(), "bytemuck::Zeroable".into()]
            }
            _ => Vec::new(),
        }
    }
}

/// 交叉编译时，让 libclang 使用目标编译器的 sysroot 或头文件搜索路径
fn target_include_args(compiler: &std::path::Path) -> Vec<String> {
    let sysroot = Command::new(compiler)
        .arg("-print-sysroot")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|sysroot| !sysroot.is_empty());
    if let Some(sysroot) = sysroot {
        println!("cargo:warning=Found sysroot via -print-sysroot: {}", sysroot);
        return vec![format!("--sysroot={}", sysroot)];
    }

    println!("cargo:warning=Sysroot not found, falling back to header path extraction...");
    let Ok(output) = Command::new(compiler)
        .args(["-E", "-Wp,-v", "-xc", "/dev/null"])
        .output()
    else {
        println!("cargo:warning=Fallback extraction failed.");
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .skip_while(|line| !line.starts_with("#include <...> search starts here:"))
        .skip(1)
        .take_while(|line| !line.starts_with("End of search list."))
        .map(|path| format!("-I{}", path.trim()))
        .collect()
}

fn main() {
    println!("cargo:rerun-if-changed=bindings.h");

    let mut builder = bindgen::Builder::default()
        .header("bindings.h")
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .parse_callbacks(Box::new(PodTypes))
        .use_core()
        .derive_default(true)
        .derive_partialeq(true)
        .derive_eq(true)
        .allowlist_type("fb_var_screeninfo")
        .allowlist_type("fb_fix_screeninfo")
        .allowlist_var("FBIOGET_VSCREENINFO")
        .allowlist_var("FBIOPUT_VSCREENINFO")
        .allowlist_var("FBIOGET_FSCREENINFO")
        .allowlist_var("FB_ACTIVATE_NOW")
        .allowlist_var("KDSETMODE")
        .allowlist_var("KD_TEXT")
        .allowlist_var("KD_GRAPHICS");

    let target = env::var("TARGET").unwrap();
    if target.contains("linux") {
        let compiler = cc::Build::new().get_compiler();
        println!("cargo:warning=Detected compiler: {:?}", compiler.path());
        builder = builder.clang_args(target_include_args(compiler.path()));
    }

    let bindings = builder
        .generate()
        .expect("Unable to generate bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings");
}
