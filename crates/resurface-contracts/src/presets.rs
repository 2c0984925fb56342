use indexmap::IndexMap;
use serde::Serialize;

/// Static catalog entry for a predefined flooring material prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesignPreset {
    pub id: String,
    pub label: String,
    pub prompt: String,
    /// Hex color used to render the swatch next to the label.
    pub swatch: String,
}

/// Read-only, insertion-ordered preset catalog. Loaded once at startup and
/// never mutated afterwards.
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    presets: IndexMap<String, DesignPreset>,
}

impl PresetCatalog {
    pub fn new(presets: Option<IndexMap<String, DesignPreset>>) -> Self {
        Self {
            presets: presets.unwrap_or_else(default_presets),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DesignPreset> {
        self.presets.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &DesignPreset> {
        self.presets.values()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_presets() -> IndexMap<String, DesignPreset> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, label: &str, prompt: &str, swatch: &str| {
        map.insert(
            id.to_string(),
            DesignPreset {
                id: id.to_string(),
                label: label.to_string(),
                prompt: prompt.to_string(),
                swatch: swatch.to_string(),
            },
        );
    };

    insert(
        "modern-slate",
        "Modern Slate",
        "modern dark grey rectangular slate tiles with minimal grout",
        "#334155",
    );
    insert(
        "terracotta",
        "Terracotta",
        "warm mediterranean terracotta paving stones",
        "#c2410c",
    );
    insert(
        "herringbone-brick",
        "Herringbone Brick",
        "classic red brick laid in a herringbone pattern",
        "#991b1b",
    );
    insert(
        "polished-concrete",
        "Polished Concrete",
        "smooth industrial polished concrete",
        "#9ca3af",
    );
    insert(
        "cobblestone",
        "Cobblestone",
        "rustic european cobblestone pathway",
        "#57534e",
    );
    insert(
        "luxury-marble",
        "Luxury Marble",
        "white carrara marble tiles with subtle grey veining",
        "#f8fafc",
    );

    map
}
