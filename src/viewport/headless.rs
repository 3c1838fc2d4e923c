//! Viewport engine without a GPU surface.
//!
//! Downloads the structure, keeps its atom coordinates and fits a camera to them.
//! Good enough to exercise the viewport lifecycle from a terminal.

use crate::viewport::{MountPoint, ViewportEngine, ViewportHandle};
use anyhow::{Context, Result};
use std::time::Duration;

/// Vertical field of view used for `auto_view`.
const FOV_Y_DEG: f32 = 45.0;

pub struct HeadlessEngine {
    http: reqwest::Client,
}

impl HeadlessEngine {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

/// Camera placement that frames the loaded atoms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewFit {
    pub center: [f32; 3],
    pub radius: f32,
    pub distance: f32,
}

pub struct HeadlessStage {
    http: reqwest::Client,
    aspect: f32,
    atoms: Vec<[f32; 3]>,
    source: Option<String>,
    view: Option<ViewFit>,
}

impl HeadlessStage {
    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn view(&self) -> Option<ViewFit> {
        self.view
    }
}

impl ViewportEngine for HeadlessEngine {
    type Handle = HeadlessStage;

    async fn attach(&self, mount: &MountPoint) -> Result<HeadlessStage> {
        tracing::debug!(mount = %mount.id, width = mount.width, height = mount.height, "headless stage created");
        Ok(HeadlessStage {
            http: self.http.clone(),
            aspect: mount.width as f32 / mount.height.max(1) as f32,
            atoms: Vec::new(),
            source: None,
            view: None,
        })
    }
}

impl ViewportHandle for HeadlessStage {
    async fn load_file(&mut self, url: &str) -> Result<()> {
        tracing::info!(url, "downloading structure");
        let text = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("failed to download {url}"))?
            .text()
            .await
            .context("failed to read structure body")?;

        let atoms = atom_positions(&text);
        if atoms.is_empty() {
            anyhow::bail!("no ATOM/HETATM records in {url}");
        }
        self.atoms = atoms;
        self.source = Some(url.to_string());
        self.view = None;
        Ok(())
    }

    fn auto_view(&mut self) {
        self.view = fit_view(&self.atoms, self.aspect);
    }

    fn dispose(mut self) -> Result<()> {
        tracing::debug!(atoms = self.atoms.len(), "headless stage disposed");
        self.atoms.clear();
        self.view = None;
        Ok(())
    }
}

/// Coordinates from fixed-column PDB ATOM/HETATM records (columns 31-54).
fn atom_positions(pdb: &str) -> Vec<[f32; 3]> {
    pdb.lines()
        .filter(|l| l.starts_with("ATOM  ") || l.starts_with("HETATM"))
        .filter_map(|l| {
            let x = l.get(30..38)?.trim().parse().ok()?;
            let y = l.get(38..46)?.trim().parse().ok()?;
            let z = l.get(46..54)?.trim().parse().ok()?;
            Some([x, y, z])
        })
        .collect()
}

fn fit_view(atoms: &[[f32; 3]], aspect: f32) -> Option<ViewFit> {
    if atoms.is_empty() {
        return None;
    }
    let n = atoms.len() as f32;
    let mut center = [0.0f32; 3];
    for a in atoms {
        for i in 0..3 {
            center[i] += a[i] / n;
        }
    }
    let radius = atoms
        .iter()
        .map(|a| {
            let d: f32 = (0..3).map(|i| (a[i] - center[i]).powi(2)).sum();
            d.sqrt()
        })
        .fold(0.0f32, f32::max)
        .max(1.0);

    // Narrow surfaces are limited by the horizontal field of view.
    let half_fov_y = FOV_Y_DEG.to_radians() / 2.0;
    let half_fov_x = (half_fov_y.tan() * aspect).atan();
    let half_fov = half_fov_y.min(half_fov_x);
    Some(ViewFit {
        center,
        radius,
        distance: radius / half_fov.sin(),
    })
}
