use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tilefuse::analysis::TritonFusionAnalysis;
use tilefuse::config::{DebugOptions, DeviceDescription, TritonGemmConfig};
use tilefuse::hlo::{ComputationId, HloModule};
use tilefuse_backend_triton::{EmitRequest, EmitterKind};

fn default_name() -> String {
    "triton_fusion".to_string()
}

/// A fusion to generate a kernel for, as read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionRequest {
    #[serde(default = "default_name")]
    pub name: String,
    pub module: HloModule,
    /// The fusion computation inside `module`.
    pub computation: ComputationId,
    #[serde(default)]
    pub analysis: Option<TritonFusionAnalysis>,
    #[serde(default)]
    pub config: TritonGemmConfig,
    #[serde(default)]
    pub emitter: Option<EmitterKind>,
    /// Device preset name or a full description.
    #[serde(default)]
    pub device: Option<DeviceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSpec {
    Preset(String),
    Description(DeviceDescription),
}

impl DeviceSpec {
    pub fn resolve(&self) -> Result<DeviceDescription> {
        match self {
            DeviceSpec::Preset(name) => resolve_device(name),
            DeviceSpec::Description(device) => Ok(device.clone()),
        }
    }
}

pub fn resolve_device(name: &str) -> Result<DeviceDescription> {
    DeviceDescription::preset(name).with_context(|| {
        format!("unknown device preset '{name}' (expected a100, h100, rtx3090, v100 or mi200)")
    })
}

impl FusionRequest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fusion request {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid fusion request {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let request: FusionRequest = serde_json::from_str(text)?;
        anyhow::ensure!(
            request.module.get_computation(request.computation).is_some(),
            "computation {:?} is not part of module {}",
            request.computation,
            request.module.name
        );
        Ok(request)
    }

    /// Emitter named in the request, otherwise the matmul emitter when an
    /// analysis is present and the row-reduction emitter when not.
    pub fn default_emitter(&self) -> EmitterKind {
        self.emitter.unwrap_or(if self.analysis.is_some() {
            EmitterKind::MatMul
        } else {
            EmitterKind::SoftMax
        })
    }

    pub fn emit_request<'a>(
        &'a self,
        device: &'a DeviceDescription,
        debug: &'a DebugOptions,
        emitter: EmitterKind,
    ) -> EmitRequest<'a> {
        EmitRequest {
            fusion_name: &self.name,
            module: &self.module,
            computation: self.computation,
            analysis: self.analysis.as_ref(),
            device,
            config: &self.config,
            debug,
            emitter,
        }
    }
}
