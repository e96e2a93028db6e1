//! 計算バックエンドの定義
//!
//! 設定の `DeviceType` に応じて CPU (NdArray) と GPU (WGPU) を切り替えます。

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

/// CPU バックエンド
pub type CpuBackend = NdArray<f32>;

/// GPU バックエンド
pub type GpuBackend = Wgpu;

/// 学習用（自動微分付き）
pub type CpuTrainingBackend = Autodiff<CpuBackend>;
pub type GpuTrainingBackend = Autodiff<GpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// 既定の GPU（利用可能な最良のアダプタ）
pub fn gpu_device() -> WgpuDevice {
    WgpuDevice::default()
}
