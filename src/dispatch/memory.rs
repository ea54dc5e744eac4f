//! In-memory document/tab model backing the dispatcher in tests and the
//! developer client.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

use super::{DriverError, PageDriver, Target, UploadFile};

const BLANK_URL: &str = "about:blank";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Button,
    Input,
    FileInput,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub kind: ElementKind,
    pub text: String,
    pub value: String,
    pub enabled: bool,
    pub attributes: HashMap<String, String>,
    pub clicks: u32,
    pub files: Vec<String>,
    pub scrolled_into_view: bool,
}

impl Element {
    pub fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            text: String::new(),
            value: String::new(),
            enabled: true,
            attributes: HashMap::new(),
            clicks: 0,
            files: Vec::new(),
            scrolled_into_view: false,
        }
    }

    pub fn button(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::new(ElementKind::Button)
        }
    }

    pub fn input() -> Self {
        Self::new(ElementKind::Input)
    }

    pub fn file_input() -> Self {
        Self::new(ElementKind::FileInput)
    }

    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::new(ElementKind::Text)
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Tab {
    pub id: u64,
    pub window_id: u64,
    pub url: String,
    pub title: String,
    pub scroll: (i64, i64),
    elements: HashMap<String, Element>,
}

impl Tab {
    fn new(id: u64, window_id: u64, url: &str) -> Self {
        Self {
            id,
            window_id,
            url: url.to_string(),
            title: String::new(),
            scroll: (0, 0),
            elements: HashMap::new(),
        }
    }

    pub fn element(&self, selector: &str) -> Option<&Element> {
        self.elements.get(selector)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPage {
    tabs: BTreeMap<u64, Tab>,
    active_tab: Option<u64>,
    next_tab_id: u64,
    next_window_id: u64,
    interaction_locked: bool,
    lock_reason: Option<String>,
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPage {
    /// One window holding one blank, active tab.
    pub fn new() -> Self {
        let mut tabs = BTreeMap::new();
        tabs.insert(1, Tab::new(1, 1, BLANK_URL));
        Self {
            tabs,
            active_tab: Some(1),
            next_tab_id: 2,
            next_window_id: 2,
            interaction_locked: false,
            lock_reason: None,
        }
    }

    pub fn active_tab_id(&self) -> Option<u64> {
        self.active_tab
    }

    pub fn tab(&self, tab_id: u64) -> Option<&Tab> {
        self.tabs.get(&tab_id)
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn insert_element(&mut self, tab_id: u64, selector: &str, element: Element) -> bool {
        match self.tabs.get_mut(&tab_id) {
            Some(tab) => {
                tab.elements.insert(selector.to_string(), element);
                true
            }
            None => false,
        }
    }

    pub fn remove_element(&mut self, tab_id: u64, selector: &str) -> Option<Element> {
        self.tabs.get_mut(&tab_id)?.elements.remove(selector)
    }

    pub fn element(&self, tab_id: u64, selector: &str) -> Option<&Element> {
        self.tabs.get(&tab_id)?.element(selector)
    }

    pub fn is_interaction_locked(&self) -> bool {
        self.interaction_locked
    }

    pub fn lock_reason(&self) -> Option<&str> {
        self.lock_reason.as_deref()
    }

    /// Whether a human could currently click or type on the page.
    pub fn accepts_user_input(&self) -> bool {
        !self.interaction_locked
    }

    fn resolve_tab_id(&self, tab_id: Option<u64>) -> Result<u64, DriverError> {
        match tab_id {
            Some(id) if self.tabs.contains_key(&id) => Ok(id),
            Some(id) => Err(DriverError::TabNotFound(id)),
            None => self.active_tab.ok_or(DriverError::NoActiveTab),
        }
    }

    fn tab_mut(&mut self, tab_id: Option<u64>) -> Result<&mut Tab, DriverError> {
        let id = self.resolve_tab_id(tab_id)?;
        self.tabs.get_mut(&id).ok_or(DriverError::TabNotFound(id))
    }

    fn element_mut(&mut self, target: &Target) -> Result<(&mut Element, String), DriverError> {
        let selector = target
            .selector
            .clone()
            .ok_or_else(|| DriverError::Execution("selector required".to_string()))?;
        let tab = self.tab_mut(target.tab_id)?;
        match tab.elements.get_mut(&selector) {
            Some(element) => Ok((element, selector)),
            None => Err(DriverError::ElementNotFound(selector)),
        }
    }

    fn activate_fallback(&mut self, window_id: u64) {
        self.active_tab = self
            .tabs
            .values()
            .find(|tab| tab.window_id == window_id)
            .or_else(|| self.tabs.values().next())
            .map(|tab| tab.id);
    }

    fn describe(&self, tab: &Tab) -> Value {
        json!({
            "tab_id": tab.id,
            "window_id": tab.window_id,
            "url": tab.url,
            "title": tab.title,
            "active": self.active_tab == Some(tab.id),
        })
    }
}

impl PageDriver for MemoryPage {
    fn click(&mut self, target: &Target) -> Result<Value, DriverError> {
        let (element, selector) = self.element_mut(target)?;
        if !element.enabled {
            return Err(DriverError::NotInteractable {
                selector,
                action: "click",
            });
        }
        element.clicks += 1;
        Ok(json!({"clicked": true, "selector": selector}))
    }

    fn type_text(&mut self, target: &Target, text: &str, clear: bool) -> Result<Value, DriverError> {
        let (element, selector) = self.element_mut(target)?;
        if element.kind != ElementKind::Input || !element.enabled {
            return Err(DriverError::NotInteractable {
                selector,
                action: "type",
            });
        }
        if clear {
            element.value.clear();
        }
        element.value.push_str(text);
        Ok(json!({"typed": text.chars().count(), "value": element.value}))
    }

    fn read(&mut self, target: &Target, attribute: Option<&str>) -> Result<Value, DriverError> {
        let (element, _) = self.element_mut(target)?;
        Ok(match attribute {
            Some(name) => json!({
                "attribute": name,
                "value": element.attributes.get(name),
            }),
            None => json!({"text": element.text, "value": element.value}),
        })
    }

    fn upload(&mut self, target: &Target, files: &[UploadFile]) -> Result<Value, DriverError> {
        let (element, selector) = self.element_mut(target)?;
        if element.kind != ElementKind::FileInput {
            return Err(DriverError::NotInteractable {
                selector,
                action: "upload",
            });
        }
        element.files = files.iter().map(|file| file.name.clone()).collect();
        let bytes: usize = files.iter().map(|file| file.bytes.len()).sum();
        Ok(json!({"files": files.len(), "bytes": bytes}))
    }

    fn scroll(&mut self, target: &Target, delta_x: i64, delta_y: i64) -> Result<Value, DriverError> {
        if target.selector.is_some() {
            let (element, selector) = self.element_mut(target)?;
            element.scrolled_into_view = true;
            return Ok(json!({"scrolled_to": selector}));
        }
        let tab = self.tab_mut(target.tab_id)?;
        tab.scroll.0 += delta_x;
        tab.scroll.1 += delta_y;
        Ok(json!({"scroll_x": tab.scroll.0, "scroll_y": tab.scroll.1}))
    }

    fn element_exists(&mut self, target: &Target) -> Result<bool, DriverError> {
        let tab_id = self.resolve_tab_id(target.tab_id)?;
        Ok(target
            .selector
            .as_deref()
            .is_some_and(|selector| self.element(tab_id, selector).is_some()))
    }

    fn create_tab(&mut self, url: Option<&str>, active: bool) -> Result<Value, DriverError> {
        let window_id = match self.active_tab.and_then(|id| self.tabs.get(&id)) {
            Some(tab) => tab.window_id,
            None => {
                let id = self.next_window_id;
                self.next_window_id += 1;
                id
            }
        };
        let id = self.next_tab_id;
        self.next_tab_id += 1;
        self.tabs
            .insert(id, Tab::new(id, window_id, url.unwrap_or(BLANK_URL)));
        if active || self.active_tab.is_none() {
            self.active_tab = Some(id);
        }
        let tab = self.tabs.get(&id).ok_or(DriverError::TabNotFound(id))?;
        Ok(self.describe(tab))
    }

    fn close_tab(&mut self, tab_id: Option<u64>) -> Result<Value, DriverError> {
        let id = self.resolve_tab_id(tab_id)?;
        let tab = self.tabs.remove(&id).ok_or(DriverError::TabNotFound(id))?;
        if self.active_tab == Some(id) {
            self.activate_fallback(tab.window_id);
        }
        Ok(json!({"closed": id}))
    }

    fn navigate(&mut self, tab_id: Option<u64>, url: &str) -> Result<Value, DriverError> {
        let tab = self.tab_mut(tab_id)?;
        tab.url = url.to_string();
        tab.title.clear();
        tab.scroll = (0, 0);
        tab.elements.clear();
        Ok(json!({"tab_id": tab.id, "url": tab.url}))
    }

    fn query_tabs(&mut self, url_pattern: Option<&str>) -> Result<Value, DriverError> {
        let tabs: Vec<Value> = self
            .tabs
            .values()
            .filter(|tab| url_pattern.map_or(true, |pattern| glob_match(pattern, &tab.url)))
            .map(|tab| self.describe(tab))
            .collect();
        Ok(Value::Array(tabs))
    }

    fn close_window(&mut self, window_id: Option<u64>) -> Result<Value, DriverError> {
        let window_id = match window_id {
            Some(id) => id,
            None => {
                let active = self.active_tab.ok_or(DriverError::NoActiveTab)?;
                self.tabs
                    .get(&active)
                    .map(|tab| tab.window_id)
                    .ok_or(DriverError::TabNotFound(active))?
            }
        };
        let before = self.tabs.len();
        self.tabs.retain(|_, tab| tab.window_id != window_id);
        let closed = before - self.tabs.len();
        if closed == 0 {
            return Err(DriverError::WindowNotFound(window_id));
        }
        if self.active_tab.is_some_and(|id| !self.tabs.contains_key(&id)) {
            self.activate_fallback(window_id);
        }
        Ok(json!({"closed_window": window_id, "closed_tabs": closed}))
    }

    fn set_interaction_lock(&mut self, locked: bool, reason: Option<&str>) -> Result<(), DriverError> {
        self.interaction_locked = locked;
        self.lock_reason = if locked { reason.map(str::to_string) } else { None };
        Ok(())
    }
}

/// `*` matches any run of characters; everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(at) => rest = &rest[at + part.len()..],
                None => return false,
            }
        }
    }
    true
}
