//! Patching of the compiled package manifest: application-identifier rename
//! and launcher-alias injection.
//!
//! Unlike the resource table (patched in place, see [`crate::res::strings`]),
//! the manifest is small enough to parse fully, so identifier renames are
//! structural: the string pool is rewritten with the new identifier and
//! every declared length and offset is recomputed on serialization.
//! Identifiers vary arbitrarily in length between users, which rules out the
//! length-preserving primitive here.

use std::io::Cursor;

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{debug, info};

use crate::res::{Chunk, ResValue, ResValueType, ResXmlAttribute, StringPool};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

const ACTION_MAIN: &str = "android.intent.action.MAIN";
const CATEGORY_LAUNCHER: &str = "android.intent.category.LAUNCHER";

/// Framework resource id of `android:targetActivity`.
const RES_ID_TARGET_ACTIVITY: u32 = 0x0101_0202;

/// A parsed compiled manifest: string pool, attribute resource map and the
/// flat event list, in document order.
#[derive(Clone, Debug)]
pub struct CompiledManifest {
    pool: StringPool,
    resource_map: Option<Vec<u32>>,
    events: Vec<Chunk>,
}

impl CompiledManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let chunk = Chunk::parse(&mut Cursor::new(bytes)).context("parsing compiled manifest")?;
        let Chunk::Xml(children) = chunk else {
            bail!("not a compiled XML document");
        };
        let mut pool = None;
        let mut resource_map = None;
        let mut events = vec![];
        for child in children {
            match child {
                Chunk::StringPool(p) if pool.is_none() => pool = Some(p),
                Chunk::XmlResourceMap(map) if resource_map.is_none() => resource_map = Some(map),
                Chunk::Null => {}
                other => events.push(other),
            }
        }
        Ok(Self {
            pool: pool.context("manifest has no string pool")?,
            resource_map,
            events,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut children = Vec::with_capacity(self.events.len() + 2);
        children.push(Chunk::StringPool(self.pool.clone()));
        if let Some(map) = &self.resource_map {
            children.push(Chunk::XmlResourceMap(map.clone()));
        }
        children.extend(self.events.iter().cloned());
        let mut buf = vec![];
        Chunk::Xml(children).write(&mut Cursor::new(&mut buf))?;
        Ok(buf)
    }

    pub fn strings(&self) -> &[String] {
        &self.pool.strings
    }

    pub fn events(&self) -> &[Chunk] {
        &self.events
    }

    /// The application identifier declared by the `package` attribute of the
    /// root element.
    pub fn application_id(&self) -> Result<String> {
        for event in &self.events {
            if let Chunk::XmlStartElement(_, el, attrs) = event {
                if self.string_at(el.name) != Some("manifest") {
                    continue;
                }
                return self
                    .plain_attr_string(attrs, "package")
                    .context("manifest has no `package` attribute");
            }
        }
        bail!("manifest has no root element")
    }

    /// Component name of the activity carrying the launcher intent filter.
    pub fn launcher_activity(&self) -> Result<String> {
        let (start, _) = self.launcher_activity_span()?;
        let Chunk::XmlStartElement(_, _, attrs) = &self.events[start] else {
            unreachable!()
        };
        self.android_attr_string(attrs, "name")
            .context("launcher activity has no `name` attribute")
    }

    /// Replaces the application identifier everywhere it occurs in the
    /// string pool, component names declared under the old identifier
    /// included. Returns the old identifier and how many pool entries were
    /// rewritten; zero occurrences of a `package` attribute at all is an
    /// error the caller maps to its fatal variant.
    pub fn rename_application_id(&mut self, new_id: &str) -> Result<(String, usize)> {
        let old_id = self.application_id()?;
        if old_id == new_id {
            return Ok((old_id, 0));
        }
        let mut rewritten = 0;
        for string in &mut self.pool.strings {
            if string.contains(old_id.as_str()) {
                *string = string.replace(old_id.as_str(), new_id);
                rewritten += 1;
            }
        }
        ensure!(rewritten > 0, "identifier `{old_id}` not present in pool");
        info!("renamed application id `{old_id}` -> `{new_id}` ({rewritten} pool entries)");
        Ok((old_id, rewritten))
    }

    /// Appends one `activity-alias` declaration per extra launcher icon,
    /// cloned from the launcher activity's attribute set and intent filter.
    /// `requested_icons` counts icons, not aliases: the main entry point
    /// already provides one icon, so `max(0, requested - 1)` aliases are
    /// injected. Returns the alias component names.
    pub fn inject_launcher_aliases(&mut self, requested_icons: u32) -> Result<Vec<String>> {
        let alias_count = requested_icons.saturating_sub(1);
        if alias_count == 0 {
            return Ok(vec![]);
        }
        ensure!(
            self.resource_map.is_some(),
            "manifest has no attribute resource map"
        );

        // Pool surgery first: inserting into the attribute-name region
        // shifts every later string reference, so do it before any index is
        // captured.
        let target_attr = self.intern_attr_name("targetActivity", RES_ID_TARGET_ACTIVITY);
        let alias_element = self.intern_tail("activity-alias");

        let android_ns = self
            .android_namespace_index()
            .context("manifest declares no android namespace")?;
        let (start, end) = self.launcher_activity_span()?;
        let Chunk::XmlStartElement(_, _, attrs) = &self.events[start] else {
            unreachable!()
        };
        let target_value = self
            .android_attr_index(attrs, "name")
            .context("launcher activity has no `name` attribute")?;
        let target_name = self.pool.strings[target_value as usize].clone();

        let mut alias_names = Vec::with_capacity(alias_count as usize);
        let mut clones = vec![];
        for i in 1..=alias_count {
            let alias_name = format!("{target_name}Alias{i}");
            let alias_value = self.intern_tail(&alias_name);
            clones.extend(self.clone_alias_span(
                start,
                end,
                alias_element,
                alias_value,
                target_value,
                target_attr,
                android_ns,
            )?);
            alias_names.push(alias_name);
        }

        let insert_at = self
            .application_end_index()
            .context("manifest has no application element")?;
        self.events.splice(insert_at..insert_at, clones);
        info!("injected {alias_count} launcher alias(es)");
        Ok(alias_names)
    }

    fn string_at(&self, index: i32) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.pool.strings.get(i))
            .map(String::as_str)
    }

    fn index_of(&self, s: &str) -> Option<i32> {
        self.pool.strings.iter().position(|x| x == s).map(|i| i as i32)
    }

    /// Interns `name` into the attribute-name region of the pool, parallel
    /// to the resource map. Existing strings after the region shift by one.
    fn intern_attr_name(&mut self, name: &str, res_id: u32) -> i32 {
        let map_len = {
            let map = self.resource_map.as_ref().expect("checked by caller");
            if let Some(i) = self.pool.strings[..map.len()]
                .iter()
                .position(|s| s == name)
            {
                if map[i] == res_id {
                    return i as i32;
                }
            }
            map.len()
        };
        self.shift_string_refs(map_len as i32);
        self.pool.strings.insert(map_len, name.to_string());
        self.resource_map.as_mut().expect("checked by caller").push(res_id);
        debug!("interned attribute name `{name}` at pool index {map_len}");
        map_len as i32
    }

    /// Interns a plain (non-attribute) string at the pool tail.
    fn intern_tail(&mut self, s: &str) -> i32 {
        if let Some(i) = self.index_of(s) {
            return i;
        }
        self.pool.strings.push(s.to_string());
        (self.pool.strings.len() - 1) as i32
    }

    /// Bumps every string reference at or above `from` by one, across all
    /// events. Must run before the new pool entry is inserted.
    fn shift_string_refs(&mut self, from: i32) {
        let bump = |index: &mut i32| {
            if *index >= from {
                *index += 1;
            }
        };
        for event in &mut self.events {
            match event {
                Chunk::XmlStartNamespace(_, ns) | Chunk::XmlEndNamespace(_, ns) => {
                    bump(&mut ns.prefix);
                    bump(&mut ns.uri);
                }
                Chunk::XmlStartElement(_, el, attrs) => {
                    bump(&mut el.namespace);
                    bump(&mut el.name);
                    for attr in attrs {
                        bump(&mut attr.namespace);
                        bump(&mut attr.name);
                        bump(&mut attr.raw_value);
                        if attr.typed_value.data_type == ResValueType::String as u8
                            && attr.typed_value.data as i32 >= from
                        {
                            attr.typed_value.data += 1;
                        }
                    }
                }
                Chunk::XmlEndElement(_, el) => {
                    bump(&mut el.namespace);
                    bump(&mut el.name);
                }
                _ => {}
            }
        }
    }

    fn android_namespace_index(&self) -> Option<i32> {
        for event in &self.events {
            if let Chunk::XmlStartNamespace(_, ns) = event {
                if self.string_at(ns.uri) == Some(ANDROID_NS) {
                    return Some(ns.uri);
                }
            }
        }
        None
    }

    /// Value string of an un-namespaced attribute such as `package`.
    fn plain_attr_string(&self, attrs: &[ResXmlAttribute], name: &str) -> Option<String> {
        attrs
            .iter()
            .find(|a| a.namespace == -1 && self.string_at(a.name) == Some(name))
            .and_then(|a| self.string_at(a.raw_value))
            .map(str::to_string)
    }

    fn android_attr_index(&self, attrs: &[ResXmlAttribute], name: &str) -> Option<i32> {
        attrs
            .iter()
            .find(|a| {
                self.string_at(a.name) == Some(name)
                    && self.string_at(a.namespace) == Some(ANDROID_NS)
            })
            .and_then(|a| (a.raw_value >= 0).then_some(a.raw_value))
    }

    fn android_attr_string(&self, attrs: &[ResXmlAttribute], name: &str) -> Option<String> {
        self.android_attr_index(attrs, name)
            .and_then(|i| self.string_at(i))
            .map(str::to_string)
    }

    /// `(start, end)` event indices of the activity element carrying the
    /// launcher intent filter, end inclusive.
    fn launcher_activity_span(&self) -> Result<(usize, usize)> {
        let mut i = 0;
        while i < self.events.len() {
            if let Chunk::XmlStartElement(_, el, _) = &self.events[i] {
                if self.string_at(el.name) == Some("activity") {
                    let end = self.matching_end(i)?;
                    if self.span_has_launcher_filter(i, end) {
                        return Ok((i, end));
                    }
                    i = end + 1;
                    continue;
                }
            }
            i += 1;
        }
        bail!("no activity with a launcher intent filter")
    }

    fn matching_end(&self, start: usize) -> Result<usize> {
        let mut depth = 0usize;
        for (j, event) in self.events.iter().enumerate().skip(start) {
            match event {
                Chunk::XmlStartElement(..) => depth += 1,
                Chunk::XmlEndElement(..) => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| anyhow!("unbalanced element nesting"))?;
                    if depth == 0 {
                        return Ok(j);
                    }
                }
                _ => {}
            }
        }
        bail!("element at {start} is never closed")
    }

    fn span_has_launcher_filter(&self, start: usize, end: usize) -> bool {
        let mut has_main = false;
        let mut has_launcher = false;
        for event in &self.events[start..=end] {
            if let Chunk::XmlStartElement(_, el, attrs) = event {
                match self.string_at(el.name) {
                    Some("action") => {
                        has_main |= self.android_attr_string(attrs, "name").as_deref()
                            == Some(ACTION_MAIN);
                    }
                    Some("category") => {
                        has_launcher |= self.android_attr_string(attrs, "name").as_deref()
                            == Some(CATEGORY_LAUNCHER);
                    }
                    _ => {}
                }
            }
        }
        has_main && has_launcher
    }

    fn application_end_index(&self) -> Option<usize> {
        self.events.iter().position(|event| {
            matches!(event, Chunk::XmlEndElement(_, el)
                if self.string_at(el.name) == Some("application"))
        })
    }

    /// Clones the launcher activity span into an `activity-alias` span.
    #[allow(clippy::too_many_arguments)]
    fn clone_alias_span(
        &self,
        start: usize,
        end: usize,
        alias_element: i32,
        alias_value: i32,
        target_value: i32,
        target_attr: i32,
        android_ns: i32,
    ) -> Result<Vec<Chunk>> {
        let mut clone: Vec<Chunk> = self.events[start..=end].to_vec();

        let Some(Chunk::XmlStartElement(_, el, attrs)) = clone.first_mut() else {
            bail!("alias clone source is not an element");
        };
        el.name = alias_element;
        for attr in attrs.iter_mut() {
            if self.string_at(attr.name) == Some("name") {
                attr.raw_value = alias_value;
                attr.typed_value = ResValue::string(alias_value as u32);
            }
        }
        attrs.push(ResXmlAttribute {
            namespace: android_ns,
            name: target_attr,
            raw_value: target_value,
            typed_value: ResValue::string(target_value as u32),
        });
        self.sort_attrs(attrs);
        el.attribute_count = attrs.len() as u16;

        let Some(Chunk::XmlEndElement(_, el)) = clone.last_mut() else {
            bail!("alias clone source is not closed by an element");
        };
        el.name = alias_element;
        Ok(clone)
    }

    /// Attributes are kept in resource-id order, attributes without a
    /// resource id after them, the way the platform compiler emits them.
    fn sort_attrs(&self, attrs: &mut [ResXmlAttribute]) {
        let map = self.resource_map.as_deref().unwrap_or(&[]);
        attrs.sort_by_key(|a| match usize::try_from(a.name) {
            Ok(i) if i < map.len() => (0u8, map[i]),
            _ => (1u8, a.name as u32),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::res::{
        ResXmlEndElement, ResXmlNamespace, ResXmlNodeHeader, ResXmlStartElement,
    };

    const NS: i32 = 4;

    fn attr(name: i32, raw: i32, ns: i32) -> ResXmlAttribute {
        ResXmlAttribute {
            namespace: ns,
            name,
            raw_value: raw,
            typed_value: ResValue::string(raw as u32),
        }
    }

    fn start(name: i32, attrs: Vec<ResXmlAttribute>) -> Chunk {
        Chunk::XmlStartElement(
            ResXmlNodeHeader::default(),
            ResXmlStartElement {
                name,
                attribute_count: attrs.len() as u16,
                ..Default::default()
            },
            attrs,
        )
    }

    fn end(name: i32) -> Chunk {
        Chunk::XmlEndElement(
            ResXmlNodeHeader::default(),
            ResXmlEndElement {
                namespace: -1,
                name,
            },
        )
    }

    /// Minimal but structurally faithful launcher manifest:
    /// pool 0..=1 is the attribute-name region (`name`, `exported`).
    fn fixture() -> Vec<u8> {
        let pool = StringPool {
            utf8: false,
            strings: vec![
                "name".into(),             // 0
                "exported".into(),         // 1
                "android".into(),          // 2
                "1.0".into(),              // 3
                ANDROID_NS.into(),         // 4
                "manifest".into(),          // 5
                "package".into(),           // 6
                "com.example.base".into(),  // 7
                "application".into(),       // 8
                "activity".into(),          // 9
                "intent-filter".into(),     // 10
                "action".into(),            // 11
                "category".into(),          // 12
                ACTION_MAIN.into(),         // 13
                CATEGORY_LAUNCHER.into(),   // 14
                ".MainActivity".into(),     // 15
            ],
            styles: vec![],
        };
        let children = vec![
            Chunk::StringPool(pool),
            Chunk::XmlResourceMap(vec![0x0101_0003, 0x0101_0010]),
            Chunk::XmlStartNamespace(
                ResXmlNodeHeader::default(),
                ResXmlNamespace { prefix: 2, uri: NS },
            ),
            start(5, vec![attr(6, 7, -1)]),
            start(8, vec![]),
            start(9, vec![attr(0, 15, NS)]),
            start(10, vec![]),
            start(11, vec![attr(0, 13, NS)]),
            end(11),
            start(12, vec![attr(0, 14, NS)]),
            end(12),
            end(10),
            end(9),
            end(8),
            end(5),
            Chunk::XmlEndNamespace(
                ResXmlNodeHeader::default(),
                ResXmlNamespace { prefix: 2, uri: NS },
            ),
        ];
        let mut buf = vec![];
        Chunk::Xml(children)
            .write(&mut std::io::Cursor::new(&mut buf))
            .unwrap();
        buf
    }

    fn count_elements(m: &CompiledManifest, name: &str) -> usize {
        m.events()
            .iter()
            .filter(|event| {
                matches!(event, Chunk::XmlStartElement(_, el, _)
                    if usize::try_from(el.name).ok()
                        .and_then(|i| m.strings().get(i))
                        .map(String::as_str) == Some(name))
            })
            .count()
    }

    #[test]
    fn should_read_application_id_and_launcher_activity() {
        let m = CompiledManifest::parse(&fixture()).unwrap();
        assert_eq!(m.application_id().unwrap(), "com.example.base");
        assert_eq!(m.launcher_activity().unwrap(), ".MainActivity");
    }

    #[test]
    fn should_rename_identifier_across_lengths() {
        let mut m = CompiledManifest::parse(&fixture()).unwrap();
        let (old, rewritten) = m.rename_application_id("com.example.myapp987").unwrap();
        assert_eq!(old, "com.example.base");
        assert_eq!(rewritten, 1);

        // Serialized lengths and offsets must match the longer identifier.
        let back = CompiledManifest::parse(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(back.application_id().unwrap(), "com.example.myapp987");
    }

    #[test]
    fn should_inject_one_alias_per_extra_icon() {
        let mut m = CompiledManifest::parse(&fixture()).unwrap();
        let names = m.inject_launcher_aliases(4).unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(
            names,
            vec![
                ".MainActivityAlias1",
                ".MainActivityAlias2",
                ".MainActivityAlias3"
            ]
        );

        let back = CompiledManifest::parse(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(count_elements(&back, "activity-alias"), 3);
        assert_eq!(count_elements(&back, "activity"), 1);
        // Each alias carries its own cloned launcher filter.
        assert_eq!(count_elements(&back, "intent-filter"), 4);
    }

    #[test]
    fn should_leave_manifest_unchanged_for_single_icon() {
        for requested in [0, 1] {
            let mut m = CompiledManifest::parse(&fixture()).unwrap();
            assert!(m.inject_launcher_aliases(requested).unwrap().is_empty());
            assert_eq!(count_elements(&m, "activity-alias"), 0);
        }
    }

    #[test]
    fn should_keep_launcher_activity_resolvable_after_aliasing() {
        // Interning `targetActivity` shifts the pool; references must stay
        // coherent end to end.
        let mut m = CompiledManifest::parse(&fixture()).unwrap();
        m.inject_launcher_aliases(3).unwrap();
        let back = CompiledManifest::parse(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(back.launcher_activity().unwrap(), ".MainActivity");
        assert_eq!(back.application_id().unwrap(), "com.example.base");
    }

    #[test]
    fn should_fail_rename_without_package_attribute() {
        let pool = StringPool {
            utf8: false,
            strings: vec!["manifest".into()],
            styles: vec![],
        };
        let children = vec![
            Chunk::StringPool(pool),
            start(0, vec![]),
            end(0),
        ];
        let mut buf = vec![];
        Chunk::Xml(children)
            .write(&mut std::io::Cursor::new(&mut buf))
            .unwrap();
        let mut m = CompiledManifest::parse(&buf).unwrap();
        assert!(m.rename_application_id("com.other.app").is_err());
    }
}
