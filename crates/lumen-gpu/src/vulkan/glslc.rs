//! SPIR-V compilation through the Vulkan SDK's `glslc`.

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::device::{DeviceError, DeviceResult};
use crate::shader::ShaderStage;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Find the glslc binary: an explicit path, then PATH, then VULKAN_SDK.
pub fn find_glslc(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        log::warn!("glslc: configured path {} does not exist", path.display());
    }

    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    if let Ok(sdk) = env::var("VULKAN_SDK") {
        for candidate in [
            PathBuf::from(&sdk).join("bin").join("glslc"),
            PathBuf::from(&sdk).join("Bin").join("glslc.exe"),
        ] {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

/// Compile one stage, passing the source on stdin and reading SPIR-V back
/// from stdout.
pub fn compile(glslc: &Path, stage: ShaderStage, name: &str, source: &str) -> DeviceResult<Vec<u32>> {
    let mut child = Command::new(glslc)
        .arg(format!("-fshader-stage={}", stage.glslc_name()))
        .args(["--target-env=vulkan1.3", "-O", "-o", "-", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DeviceError::Compile(format!("{}: failed to run {}: {}", name, glslc.display(), e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(source.as_bytes())
            .map_err(|e| DeviceError::Compile(format!("{}: failed to feed glslc: {}", name, e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| DeviceError::Compile(format!("{}: glslc did not finish: {}", name, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeviceError::Compile(format!("{}: {}", name, stderr.trim())));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        log::warn!("glslc {}: {}", name, stderr.trim());
    }

    parse_spirv(&output.stdout).map_err(|e| DeviceError::Compile(format!("{}: {}", name, e)))
}

/// Reinterpret a SPIR-V byte stream as words, checking the header.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.len() % 4 != 0 || bytes.len() < 20 {
        return Err(format!("malformed SPIR-V: {} bytes", bytes.len()));
    }

    let words: Vec<u32> = bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned::<u32>).collect();

    if words[0] != SPIRV_MAGIC {
        return Err(format!("bad SPIR-V magic {:#010x}", words[0]));
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<u8> {
        let words: [u32; 5] = [SPIRV_MAGIC, 0x0001_0600, 0, 8, 0];
        bytemuck::cast_slice(&words).to_vec()
    }

    #[test]
    fn test_parse_spirv_words() {
        let words = parse_spirv(&header()).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[3], 8);
    }

    #[test]
    fn test_parse_spirv_rejects_garbage() {
        let mut bytes = header();
        bytes[0] ^= 0xff;
        assert!(parse_spirv(&bytes).is_err());
        assert!(parse_spirv(&header()[..18]).is_err());
        assert!(parse_spirv(&[]).is_err());
    }

    #[test]
    fn test_missing_explicit_path_falls_through() {
        let missing = Path::new("/nonexistent/lumen/glslc");
        assert_ne!(find_glslc(Some(missing)).as_deref(), Some(missing));
    }
}
