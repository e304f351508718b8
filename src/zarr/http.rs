use super::ome::{OmeDataset, OmeMultiScale, OmeZarrAttrs};
use super::{parse_zarr_json, ArrayMeta, ZarrNode};
use crate::downloader::{CancelToken, ChunkStore, FetchError};
use crate::error::StreamError;
use crate::model::{Axis, AxisKind, ChunkAddress, NonSpatialCoords, PyramidLevel, PyramidModel};
use crate::volume::VoxelData;
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine as _;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;

/// Levels probed when a group carries no multiscales metadata.
const MAX_PROBED_LEVELS: usize = 20;

#[derive(Debug)]
struct LevelArray {
    path: String,
    meta: Arc<ArrayMeta>,
}

/// Array layout learned by `fetch_metadata`, read-only afterwards.
#[derive(Debug)]
struct StoreLayout {
    axes: Vec<Axis>,
    levels: Vec<LevelArray>,
}
impl StoreLayout {
    fn spatial_positions(&self) -> Vec<usize> {
        self.axes
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_spatial())
            .map(|(i, _)| i)
            .collect()
    }
}

/// [`ChunkStore`] over a zarr v2 or v3 hierarchy served via HTTP(S).
#[derive(derive_more::Debug)]
pub struct HttpChunkStore {
    base_url: String,
    #[debug(skip)]
    authorization: Option<String>,
    layout: RwLock<Option<Arc<StoreLayout>>>,
}

impl HttpChunkStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: None,
            layout: RwLock::new(None),
        }
    }

    /// Sends `user:password` as HTTP basic authorization with every request.
    pub fn with_authorization(mut self, credentials: &str) -> Self {
        self.authorization = Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        ));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, key: &str) -> String {
        if path.is_empty() {
            format!("{}/{}", self.base_url, key)
        } else {
            format!("{}/{}/{}", self.base_url, path.trim_matches('/'), key)
        }
    }

    /// GETs `url`. A missing object (404) comes back as `None`.
    async fn get(&self, url: String) -> Result<Option<Vec<u8>>, FetchError> {
        let mut request = ehttp::Request::get(&url);
        if let Some(authorization) = &self.authorization {
            request.headers.insert("Authorization".to_string(), authorization.clone());
        }
        let response = ehttp::fetch_async(request).await.map_err(FetchError::Transport)?;
        missing_or_error(response.status, response.bytes, url)
    }

    /// Metadata documents are optional, so a 403 from a bucket without list
    /// permission counts as absent here.
    async fn get_json(&self, path: &str, key: &str) -> anyhow::Result<Option<String>> {
        let url = self.url(path, key);
        let bytes = match self.get(url.clone()).await {
            Err(FetchError::Http { status: 403, .. }) => {
                debug!("{url} forbidden, treating it as absent");
                None
            }
            other => other.with_context(|| format!("fetching {url}"))?,
        };
        match bytes {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).with_context(|| format!("{url} is not UTF-8"))?)),
            None => Ok(None),
        }
    }

    /// Opens the array at `path`, v2 first. `None` if there is no array.
    async fn open_array(&self, path: &str) -> anyhow::Result<Option<ArrayMeta>> {
        if let Some(json) = self.get_json(path, ".zarray").await? {
            return ArrayMeta::from_zarray(&json).map(Some).with_context(|| format!("array at /{path}"));
        }
        match self.get_json(path, "zarr.json").await? {
            Some(json) => match parse_zarr_json(&json).with_context(|| format!("node at /{path}"))? {
                ZarrNode::Array(meta) => Ok(Some(meta)),
                ZarrNode::Group { .. } => Ok(None),
            },
            None => Ok(None),
        }
    }

    async fn root_attributes(&self) -> anyhow::Result<Option<OmeZarrAttrs>> {
        if let Some(json) = self.get_json("", ".zattrs").await? {
            return Ok(Some(OmeZarrAttrs::from_json(&json).context("invalid .zattrs")?));
        }
        match self.get_json("", "zarr.json").await? {
            Some(json) => match parse_zarr_json(&json)? {
                ZarrNode::Group { attributes } if !attributes.is_null() => {
                    Ok(Some(OmeZarrAttrs::from_value(attributes).context("invalid group attributes")?))
                }
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    async fn discover(&self) -> anyhow::Result<(PyramidModel, StoreLayout)> {
        if let Some(meta) = self.open_array("").await? {
            debug!("{} is a single array", self.base_url);
            return build_pyramid(&self.base_url, None, vec![(String::new(), meta, None)]);
        }

        let attrs = self.root_attributes().await?;
        let multiscale = attrs.as_ref().and_then(|a| a.multiscale()).cloned();
        let mut levels = vec![];
        match &multiscale {
            Some(ms) => {
                for dataset in &ms.datasets {
                    match self.open_array(&dataset.path).await {
                        Ok(Some(meta)) => levels.push((dataset.path.clone(), meta, Some(dataset.clone()))),
                        Ok(None) => warn!("Dataset {} of {} is not an array, skipping", dataset.path, self.base_url),
                        Err(e) => warn!("Could not open dataset {} of {}: {e:#}", dataset.path, self.base_url),
                    }
                }
            }
            None => {
                for i in 0..MAX_PROBED_LEVELS {
                    match self.open_array(&i.to_string()).await {
                        Ok(Some(meta)) => levels.push((i.to_string(), meta, None)),
                        _ => break,
                    }
                }
            }
        }
        if levels.is_empty() {
            bail!("no readable pyramid levels");
        }
        build_pyramid(&self.base_url, multiscale.as_ref(), levels)
    }

    fn layout(&self) -> Option<Arc<StoreLayout>> {
        self.layout.read().clone()
    }
}

/// Names for arrays without axis metadata: trailing dims are spatial.
fn missing_or_error(status: u16, bytes: Vec<u8>, url: String) -> Result<Option<Vec<u8>>, FetchError> {
    match status {
        200..=299 => Ok(Some(bytes)),
        404 => Ok(None),
        403 => {
            warn!("Access denied for {url}");
            Err(FetchError::Http { status, url })
        }
        status => Err(FetchError::Http { status, url }),
    }
}

fn default_axis_names(ndim: usize) -> Vec<String> {
    let spatial: &[&str] = if ndim >= 3 { &["z", "y", "x"] } else { &["y", "x"] };
    let leading = ndim.saturating_sub(spatial.len());
    let non_spatial: Vec<String> = match leading {
        0 => vec![],
        1 => vec!["c".into()],
        2 => vec!["t".into(), "c".into()],
        n => (0..n).map(|i| format!("dim{i}")).collect(),
    };
    non_spatial
        .into_iter()
        .chain(spatial.iter().map(|s| s.to_string()))
        .collect()
}

fn derive_axes(multiscale: Option<&OmeMultiScale>, first: &ArrayMeta) -> Vec<Axis> {
    let ndim = first.ndim();
    let size = |i: usize| first.shape[i];
    if let Some(ms) = multiscale.filter(|ms| ms.axes.len() == ndim) {
        return ms
            .axes
            .iter()
            .enumerate()
            .map(|(i, a)| Axis {
                name: a.name().to_string(),
                kind: AxisKind::from_ome(a.kind(), a.name()),
                unit: a.unit().map(str::to_string),
                size: size(i),
            })
            .collect();
    }
    let names = first
        .dimension_names
        .clone()
        .filter(|names| names.len() == ndim && names.iter().any(|n| n == "x"))
        .unwrap_or_else(|| default_axis_names(ndim));
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| Axis {
            kind: AxisKind::from_ome(None, &name),
            name,
            unit: None,
            size: size(i),
        })
        .collect()
}

fn pick<T: Copy>(values: &[T], positions: &[usize]) -> Vec<T> {
    positions.iter().map(|&p| values[p]).collect()
}

fn build_pyramid(
    name: &str,
    multiscale: Option<&OmeMultiScale>,
    arrays: Vec<(String, ArrayMeta, Option<OmeDataset>)>,
) -> anyhow::Result<(PyramidModel, StoreLayout)> {
    let Some((_, first, _)) = arrays.first() else {
        bail!("no pyramid levels");
    };
    let axes = derive_axes(multiscale, first);
    let spatial: Vec<usize> = axes
        .iter()
        .enumerate()
        .filter(|(_, a)| a.is_spatial())
        .map(|(i, _)| i)
        .collect();
    let ndim = axes.len();

    let mut levels = vec![];
    let mut arrays_out = vec![];
    for (path, meta, dataset) in arrays {
        if meta.ndim() != ndim {
            warn!("Skipping level {path}: {} dims, expected {ndim}", meta.ndim());
            continue;
        }
        let transform = |values: Option<&[f64]>| values.filter(|v| v.len() == ndim).map(|v| pick(v, &spatial));
        let dataset = dataset.as_ref();
        levels.push(PyramidLevel {
            index: levels.len(),
            path: path.clone(),
            shape: pick(&meta.shape, &spatial),
            chunk_shape: pick(&meta.chunks, &spatial),
            voxel_scale: transform(dataset.and_then(|d| d.scale())).unwrap_or_else(|| vec![1.0; spatial.len()]),
            translation: transform(dataset.and_then(|d| d.translation())),
            dtype: meta.dtype,
        });
        arrays_out.push(LevelArray {
            path,
            meta: Arc::new(meta),
        });
    }
    let pyramid = PyramidModel::new(name, axes.clone(), levels).map_err(anyhow::Error::new)?;
    Ok((
        pyramid,
        StoreLayout {
            axes,
            levels: arrays_out,
        },
    ))
}

/// Full grid index of a chunk plus the element offset of the selected
/// non-spatial slice within it.
fn locate_chunk(
    layout: &StoreLayout,
    meta: &ArrayMeta,
    address: &ChunkAddress,
    non_spatial: &NonSpatialCoords,
) -> Result<(Vec<usize>, usize), FetchError> {
    let spatial = layout.spatial_positions();
    let spatial_index: Vec<usize> = match (spatial.len(), address.z) {
        (3, Some(z)) => vec![z, address.y, address.x],
        (3, None) => vec![0, address.y, address.x],
        _ => vec![address.y, address.x],
    };

    let mut index = vec![0; meta.ndim()];
    let mut offset = 0;
    let mut stride = 1;
    let mut seen_spatial = false;
    let mut spatial_iter = spatial_index.into_iter();
    // walk fastest to slowest so strides accumulate
    for (i, axis) in layout.axes.iter().enumerate().rev() {
        if axis.is_spatial() {
            index[i] = spatial_iter.next_back().unwrap_or(0);
            seen_spatial = true;
        } else {
            let coord = non_spatial.get(&axis.name).unwrap_or(0);
            let chunk = meta.chunks[i];
            index[i] = coord / chunk;
            if chunk > 1 && !seen_spatial {
                return Err(FetchError::Decode(format!(
                    "non-spatial axis {} is chunked after a spatial axis",
                    axis.name
                )));
            }
            offset += (coord % chunk) * stride;
        }
        stride *= meta.chunks[i];
    }
    Ok((index, offset))
}

#[async_trait]
impl ChunkStore for HttpChunkStore {
    async fn fetch_metadata(&self) -> Result<PyramidModel, StreamError> {
        let (pyramid, layout) = self
            .discover()
            .await
            .map_err(|e| StreamError::MetadataUnavailable(format!("{}: {e:#}", self.base_url)))?;
        info!(
            "Opened {} with {} levels, axes {:?}",
            self.base_url,
            pyramid.level_count(),
            layout.axes.iter().map(|a| a.name.as_str()).collect::<Vec<_>>()
        );
        *self.layout.write() = Some(Arc::new(layout));
        Ok(pyramid)
    }

    async fn fetch_chunk(
        &self,
        address: &ChunkAddress,
        non_spatial: &NonSpatialCoords,
        cancel: &CancelToken,
    ) -> Result<VoxelData, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let layout = self.layout().ok_or(FetchError::UnknownLevel(address.level))?;
        let level = layout
            .levels
            .get(address.level)
            .ok_or(FetchError::UnknownLevel(address.level))?;
        let meta = level.meta.clone();
        let (index, offset) = locate_chunk(&layout, &meta, address, non_spatial)?;
        let url = self.url(&level.path, &meta.chunk_key(&index));

        let bytes = cancel.run(self.get(url.clone())).await??;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let spatial_len: usize = pick(&meta.chunks, &layout.spatial_positions()).iter().product();
        let chunk = match bytes {
            None => {
                debug!("{url} missing, using fill value");
                meta.fill_chunk(spatial_len)
            }
            Some(bytes) => {
                let decoded = tokio::task::spawn_blocking(move || meta.decode_chunk(&bytes))
                    .await
                    .map_err(|e| FetchError::Decode(e.to_string()))?
                    .map_err(|e| FetchError::Decode(format!("{url}: {e:#}")))?;
                slice_elements(decoded, offset, spatial_len)
            }
        };
        Ok(chunk)
    }
}

fn slice_elements(data: VoxelData, offset: usize, len: usize) -> VoxelData {
    if offset == 0 && data.len() == len {
        return data;
    }
    let end = (offset + len).min(data.len());
    let start = offset.min(end);
    match data {
        VoxelData::U8(v) => VoxelData::U8(v[start..end].to_vec()),
        VoxelData::I8(v) => VoxelData::I8(v[start..end].to_vec()),
        VoxelData::U16(v) => VoxelData::U16(v[start..end].to_vec()),
        VoxelData::I16(v) => VoxelData::I16(v[start..end].to_vec()),
        VoxelData::U32(v) => VoxelData::U32(v[start..end].to_vec()),
        VoxelData::I32(v) => VoxelData::I32(v[start..end].to_vec()),
        VoxelData::F32(v) => VoxelData::F32(v[start..end].to_vec()),
        VoxelData::F64(v) => VoxelData::F64(v[start..end].to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dims3;

    fn zarray(shape: &[usize], chunks: &[usize]) -> ArrayMeta {
        ArrayMeta::from_zarray(&format!(
            r#"{{"chunks": {chunks:?}, "compressor": null, "dtype": "|u1", "fill_value": 0,
                "filters": null, "order": "C", "shape": {shape:?}, "zarr_format": 2}}"#
        ))
        .unwrap()
    }

    fn multiscale(json: &str) -> OmeMultiScale {
        OmeZarrAttrs::from_json(json).unwrap().multiscale().unwrap().clone()
    }

    #[test]
    fn builds_ome_pyramid() {
        let ms = multiscale(
            r#"{"multiscales": [{"axes": [
                {"name": "c", "type": "channel"},
                {"name": "z", "type": "space", "unit": "micrometer"},
                {"name": "y", "type": "space", "unit": "micrometer"},
                {"name": "x", "type": "space", "unit": "micrometer"}],
              "datasets": [
                {"path": "0", "coordinateTransformations": [{"type": "scale", "scale": [1, 2, 0.5, 0.5]}]},
                {"path": "1", "coordinateTransformations": [{"type": "scale", "scale": [1, 4, 1, 1]}]}]}]}"#,
        );
        let arrays = vec![
            ("0".to_string(), zarray(&[3, 40, 64, 64], &[1, 16, 32, 32]), Some(ms.datasets[0].clone())),
            ("1".to_string(), zarray(&[3, 20, 32, 32], &[1, 16, 32, 32]), Some(ms.datasets[1].clone())),
        ];
        let (pyramid, layout) = build_pyramid("http://host/img.zarr", Some(&ms), arrays).unwrap();
        assert!(pyramid.is_3d());
        assert_eq!(pyramid.level_count(), 2);
        let level0 = pyramid.level_info(0).unwrap();
        assert_eq!(level0.dims(), Dims3::new(64, 64, 40));
        assert_eq!(level0.voxel_scale, vec![2.0, 0.5, 0.5]);
        assert_eq!(pyramid.level_info(1).unwrap().chunk_shape, vec![16, 32, 32]);
        assert_eq!(pyramid.spatial_units(), vec![Some("micrometer"); 3]);
        assert_eq!(pyramid.bind_non_spatial(1).get("c"), Some(1));
        assert_eq!(layout.spatial_positions(), vec![1, 2, 3]);
    }

    #[test]
    fn plain_arrays_get_default_axes() {
        let (pyramid, layout) =
            build_pyramid("flat", None, vec![(String::new(), zarray(&[100, 80], &[32, 32]), None)]).unwrap();
        assert!(!pyramid.is_3d());
        assert_eq!(layout.axes.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), vec!["y", "x"]);
        assert_eq!(pyramid.level_info(0).unwrap().voxel_scale, vec![1.0, 1.0]);
        assert_eq!(default_axis_names(5), vec!["t", "c", "z", "y", "x"]);
    }

    #[test]
    fn skips_levels_with_other_rank() {
        let arrays = vec![
            ("0".to_string(), zarray(&[10, 10, 10], &[5, 5, 5]), None),
            ("1".to_string(), zarray(&[5, 5], &[5, 5]), None),
        ];
        let (pyramid, layout) = build_pyramid("mixed", None, arrays).unwrap();
        assert_eq!(pyramid.level_count(), 1);
        assert_eq!(layout.levels.len(), 1);
    }

    #[test]
    fn locates_chunks_and_channel_slices() {
        let meta = zarray(&[3, 64, 64, 64], &[3, 32, 32, 32]);
        let (pyramid, layout) = build_pyramid("c", None, vec![("0".into(), meta.clone(), None)]).unwrap();
        let coords = pyramid.bind_non_spatial(2);
        let (index, offset) = locate_chunk(&layout, &meta, &ChunkAddress::new(0, 1, 0, Some(1)), &coords).unwrap();
        assert_eq!(index, vec![0, 1, 0, 1]);
        assert_eq!(offset, 2 * 32 * 32 * 32);
        assert_eq!(meta.chunk_key(&index), "0.1.0.1");

        let sliced = slice_elements(VoxelData::U8((0..12).collect()), 8, 4);
        assert_eq!(sliced, VoxelData::U8(vec![8, 9, 10, 11]));
    }

    #[test]
    fn only_404_means_missing() {
        let url = || "http://host/img.zarr/0/0.0.0".to_string();
        assert_eq!(missing_or_error(200, vec![1, 2], url()), Ok(Some(vec![1, 2])));
        assert_eq!(missing_or_error(404, vec![], url()), Ok(None));
        assert_eq!(
            missing_or_error(403, vec![], url()),
            Err(FetchError::Http { status: 403, url: url() })
        );
        assert!(matches!(
            missing_or_error(500, vec![], url()),
            Err(FetchError::Http { status: 500, .. })
        ));
    }

    #[test]
    fn builds_urls() {
        let store = HttpChunkStore::new("https://host/data.zarr/").with_authorization("user:pass");
        assert_eq!(store.url("", ".zattrs"), "https://host/data.zarr/.zattrs");
        assert_eq!(store.url("0/", "c/0/0/0"), "https://host/data.zarr/0/c/0/0/0");
        assert_eq!(store.authorization.as_deref(), Some("Basic dXNlcjpwYXNz"));
    }
}
