use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct OmeMultiScale {
    #[serde(default)]
    pub axes: Vec<OmeAxisDef>,
    pub datasets: Vec<OmeDataset>,
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Axes are plain names before 0.4 and objects afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OmeAxisDef {
    Name(String),
    Axis(OmeAxis),
}
impl OmeAxisDef {
    pub fn name(&self) -> &str {
        match self {
            OmeAxisDef::Name(name) => name,
            OmeAxisDef::Axis(axis) => &axis.name,
        }
    }
    pub fn kind(&self) -> Option<&str> {
        match self {
            OmeAxisDef::Name(_) => None,
            OmeAxisDef::Axis(axis) => axis.r#type.as_deref(),
        }
    }
    pub fn unit(&self) -> Option<&str> {
        match self {
            OmeAxisDef::Name(_) => None,
            OmeAxisDef::Axis(axis) => axis.unit.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OmeAxis {
    pub name: String,
    pub r#type: Option<String>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmeDataset {
    #[serde(default)]
    pub coordinate_transformations: Vec<OmeCoordinateTransformation>,
    pub path: String,
}
impl OmeDataset {
    pub fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            OmeCoordinateTransformation::Scale { scale } => Some(scale.as_slice()),
            _ => None,
        })
    }
    pub fn translation(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            OmeCoordinateTransformation::Translation { translation } => Some(translation.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OmeCoordinateTransformation {
    Scale {
        #[serde(default)]
        scale: Vec<f64>,
    },
    Translation {
        #[serde(default)]
        translation: Vec<f64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OmeNamespace {
    #[serde(default)]
    pub multiscales: Vec<OmeMultiScale>,
    pub version: Option<String>,
}

/// Group attributes. 0.5 nests the metadata under `ome`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OmeZarrAttrs {
    #[serde(default)]
    pub multiscales: Vec<OmeMultiScale>,
    #[serde(default)]
    pub ome: Option<OmeNamespace>,
}

impl OmeZarrAttrs {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The first multiscale image, preferring the 0.5 location.
    pub fn multiscale(&self) -> Option<&OmeMultiScale> {
        self.ome
            .as_ref()
            .and_then(|ome| ome.multiscales.first())
            .or_else(|| self.multiscales.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v04_attributes() {
        let attrs = OmeZarrAttrs::from_json(
            r#"{
            "multiscales": [{
                "version": "0.4",
                "name": "scan",
                "axes": [
                    {"name": "c", "type": "channel"},
                    {"name": "z", "type": "space", "unit": "micrometer"},
                    {"name": "y", "type": "space", "unit": "micrometer"},
                    {"name": "x", "type": "space", "unit": "micrometer"}
                ],
                "datasets": [
                    {"path": "0", "coordinateTransformations": [{"type": "scale", "scale": [1.0, 0.5, 0.5, 0.5]}]},
                    {"path": "1", "coordinateTransformations": [
                        {"type": "scale", "scale": [1.0, 1.0, 1.0, 1.0]},
                        {"type": "translation", "translation": [0.0, 0.25, 0.25, 0.25]}
                    ]}
                ],
                "coordinateTransformations": [{"type": "identity"}]
            }]
        }"#,
        )
        .unwrap();
        let ms = attrs.multiscale().unwrap();
        assert_eq!(ms.axes.len(), 4);
        assert_eq!(ms.axes[0].kind(), Some("channel"));
        assert_eq!(ms.axes[1].unit(), Some("micrometer"));
        assert_eq!(ms.datasets[0].scale(), Some(&[1.0, 0.5, 0.5, 0.5][..]));
        assert_eq!(ms.datasets[0].translation(), None);
        assert_eq!(ms.datasets[1].translation(), Some(&[0.0, 0.25, 0.25, 0.25][..]));
    }

    #[test]
    fn parses_v05_and_legacy_axes() {
        let attrs = OmeZarrAttrs::from_json(
            r#"{"ome": {"version": "0.5", "multiscales": [{
                "axes": ["z", "y", "x"],
                "datasets": [{"path": "s0"}]
            }]}}"#,
        )
        .unwrap();
        let ms = attrs.multiscale().unwrap();
        assert_eq!(ms.axes[2].name(), "x");
        assert_eq!(ms.axes[2].kind(), None);
        assert_eq!(ms.datasets[0].path, "s0");
        assert!(ms.datasets[0].scale().is_none());
    }

    #[test]
    fn no_multiscales() {
        let attrs = OmeZarrAttrs::from_json(r#"{"something": "else"}"#).unwrap();
        assert!(attrs.multiscale().is_none());
    }
}
