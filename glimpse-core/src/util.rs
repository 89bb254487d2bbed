use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use image::{imageops::FilterType, DynamicImage};
use tokenizers::Tokenizer;
use tracing::warn;

use crate::{DeviceMap, ModelDescriptor};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("running on CPU, build with `--features metal` to run on the GPU");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("running on CPU, build with `--features cuda` to run on the GPU");
            Ok(Device::Cpu)
        }
    }
}

/// Resizes to `size`×`size` and returns a normalised (3, size, size) f32 tensor.
pub fn image_to_tensor(
    img: &DynamicImage,
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    device: &Device,
) -> Result<Tensor> {
    let img = img
        .resize_to_fill(size, size, FilterType::Triangle)
        .to_rgb8()
        .into_raw();
    let side = size as usize;
    let pixels = Tensor::from_vec(img, (side, side, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let mean = Tensor::new(&mean, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&std, device)?.reshape((3, 1, 1))?;
    Ok((pixels / 255.)?.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// The weights repo of a descriptor, pinned to its revision when it has one.
pub fn hub_repo(api: &Api, descriptor: &ModelDescriptor) -> ApiRepo {
    match &descriptor.revision {
        Some(revision) => api.repo(Repo::with_revision(
            descriptor.repo.clone(),
            RepoType::Model,
            revision.clone(),
        )),
        None => api.repo(Repo::model(descriptor.repo.clone())),
    }
}

/// Fetches every safetensors shard of a repo, single-file or indexed.
pub async fn hub_safetensors(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let index = match repo.get("model.safetensors.index.json").await {
        Ok(index) => index,
        Err(_) => {
            let single = repo
                .get("model.safetensors")
                .await
                .context("failed to get model.safetensors")?;
            return Ok(vec![single]);
        }
    };
    let index = std::fs::read_to_string(&index).context("failed to read safetensors index")?;
    let index: serde_json::Value =
        serde_json::from_str(&index).context("failed to parse safetensors index")?;
    let shards: BTreeSet<&str> = index
        .get("weight_map")
        .and_then(|map| map.as_object())
        .context("safetensors index has no weight_map")?
        .values()
        .filter_map(|file| file.as_str())
        .collect();
    let mut paths = Vec::with_capacity(shards.len());
    for shard in shards {
        let path = repo
            .get(shard)
            .await
            .with_context(|| format!("failed to get {shard}"))?;
        paths.push(path);
    }
    Ok(paths)
}

pub async fn hub_tokenizer(repo: &ApiRepo) -> Result<Tokenizer> {
    let file = repo
        .get("tokenizer.json")
        .await
        .context("failed to get tokenizer")?;
    Tokenizer::from_file(file)
        .map_err(anyhow::Error::msg)
        .context("failed to load tokenizer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn image_tensor_is_normalised_chw() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 6, Rgb([255, 0, 127])));
        let t = image_to_tensor(&img, 8, [0.5; 3], [0.5; 3], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 8, 8]);
        let red = t.get(0).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(red.iter().all(|v| (v - 1.0).abs() < 1e-5));
        let green = t.get(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(green.iter().all(|v| (v + 1.0).abs() < 1e-5));
    }
}
