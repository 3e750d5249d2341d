use serde::{Deserialize, Serialize};

pub const NVIDIA_GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const ASCEND_310P_RESOURCE: &str = "huawei.com/Ascend310P";
pub const ASCEND_910B_RESOURCE: &str = "huawei.com/Ascend910B";

/// Accelerator family of a node, as derived from probes or resource keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AcceleratorType {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "nvidia")]
    Nvidia,
    #[serde(rename = "ascend-310p")]
    Ascend310P,
    #[serde(rename = "ascend-910b")]
    Ascend910B,
}

impl AcceleratorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorType::None => "",
            AcceleratorType::Nvidia => "nvidia",
            AcceleratorType::Ascend310P => "ascend-310p",
            AcceleratorType::Ascend910B => "ascend-910b",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "nvidia" => AcceleratorType::Nvidia,
            "ascend-310p" => AcceleratorType::Ascend310P,
            "ascend-910b" => AcceleratorType::Ascend910B,
            _ => AcceleratorType::None,
        }
    }

    pub fn is_nvidia(&self) -> bool {
        matches!(self, AcceleratorType::Nvidia)
    }

    pub fn is_ascend(&self) -> bool {
        matches!(self, AcceleratorType::Ascend310P | AcceleratorType::Ascend910B)
    }

    /// Suffix appended to the serving image tag. NVIDIA and CPU nodes use the
    /// plain tag.
    pub fn image_tag_suffix(&self) -> &'static str {
        match self {
            AcceleratorType::None | AcceleratorType::Nvidia => "",
            AcceleratorType::Ascend310P => "-ascend-310p",
            AcceleratorType::Ascend910B => "-ascend-910b",
        }
    }

    /// `tag` with the suffix for this accelerator applied once.
    pub fn image_tag(&self, tag: &str) -> String {
        let suffix = self.image_tag_suffix();
        if suffix.is_empty() || tag.ends_with(suffix) {
            tag.to_string()
        } else {
            format!("{tag}{suffix}")
        }
    }

    /// Decide from node probes: NVIDIA when `nvidia-smi` succeeded, otherwise
    /// the `npu-smi info` output if the probe succeeded, otherwise none.
    pub fn from_probes(nvidia_smi_ok: bool, npu_smi_output: Option<&str>) -> Self {
        if nvidia_smi_ok {
            return AcceleratorType::Nvidia;
        }
        match npu_smi_output {
            Some(out) if out.contains("910B") => AcceleratorType::Ascend910B,
            Some(out) if out.contains("310P") => AcceleratorType::Ascend310P,
            Some(_) => AcceleratorType::Ascend310P,
            None => AcceleratorType::None,
        }
    }

    /// Derive from a container resource map.
    pub fn from_resource_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> Self {
        let mut found = AcceleratorType::None;
        for key in keys {
            match key.as_str() {
                NVIDIA_GPU_RESOURCE => return AcceleratorType::Nvidia,
                ASCEND_910B_RESOURCE => found = AcceleratorType::Ascend910B,
                ASCEND_310P_RESOURCE if found == AcceleratorType::None => {
                    found = AcceleratorType::Ascend310P
                }
                _ => {}
            }
        }
        found
    }
}

impl std::fmt::Display for AcceleratorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_accelerator_detection() {
        assert_eq!(AcceleratorType::from_probes(true, Some("910B")), AcceleratorType::Nvidia);
        assert_eq!(
            AcceleratorType::from_probes(false, Some("| 0  910B3 | OK |")),
            AcceleratorType::Ascend910B
        );
        assert_eq!(
            AcceleratorType::from_probes(false, Some("| 0  310P3 | OK |")),
            AcceleratorType::Ascend310P
        );
        assert_eq!(
            AcceleratorType::from_probes(false, Some("npu-smi 23.0.0")),
            AcceleratorType::Ascend310P
        );
        assert_eq!(AcceleratorType::from_probes(false, None), AcceleratorType::None);
    }

    #[test]
    fn test_from_resource_keys() {
        let mut res = BTreeMap::new();
        res.insert("cpu".to_string(), "4".to_string());
        assert_eq!(AcceleratorType::from_resource_keys(res.keys()), AcceleratorType::None);
        res.insert(ASCEND_310P_RESOURCE.to_string(), "1".to_string());
        assert_eq!(
            AcceleratorType::from_resource_keys(res.keys()),
            AcceleratorType::Ascend310P
        );
        res.insert(NVIDIA_GPU_RESOURCE.to_string(), "1".to_string());
        assert_eq!(AcceleratorType::from_resource_keys(res.keys()), AcceleratorType::Nvidia);
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(AcceleratorType::Nvidia.image_tag("v1.0.0"), "v1.0.0");
        assert_eq!(AcceleratorType::None.image_tag("v1.0.0"), "v1.0.0");
        assert_eq!(
            AcceleratorType::Ascend910B.image_tag("v1.0.0"),
            "v1.0.0-ascend-910b"
        );
        assert_eq!(
            AcceleratorType::Ascend910B.image_tag("v1.0.0-ascend-910b"),
            "v1.0.0-ascend-910b"
        );
    }
}
