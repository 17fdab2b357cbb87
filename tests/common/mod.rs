//! Shared fixtures: a synthetic template archive with a compiled manifest
//! and a resource-table stand-in carrying the patchable strings.

use std::io::{Cursor, Write};
use std::path::Path;

use shellpack::manifest::ANDROID_NS;
use shellpack::res::{
    Chunk, ResValue, ResXmlAttribute, ResXmlEndElement, ResXmlNamespace, ResXmlNodeHeader,
    ResXmlStartElement, StringPool,
};
use zip::write::FileOptions;
use zip::ZipWriter;

pub const TEMPLATE_LABEL: &str = "TemplateApp";
pub const TEMPLATE_ID: &str = "com.example.base";
pub const ICON_STEM: &str = "ic_launcher_foreground";

pub fn debug_pem() -> &'static str {
    include_str!("../data/debug.pem")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

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

/// A compiled manifest equivalent to:
/// `<manifest package="com.example.base"><application>
///   <activity android:name=".MainActivity"><intent-filter>
///     <action android:name="...MAIN"/><category android:name="...LAUNCHER"/>
///   </intent-filter></activity></application></manifest>`
pub fn template_manifest() -> Vec<u8> {
    const NS: i32 = 2;
    let pool = StringPool {
        utf8: false,
        strings: vec![
            "name".into(),                              // 0, attribute region
            "exported".into(),                          // 1, attribute region
            ANDROID_NS.into(),                          // 2
            "android".into(),                           // 3
            "manifest".into(),                          // 4
            "package".into(),                           // 5
            TEMPLATE_ID.into(),                         // 6
            "application".into(),                       // 7
            "activity".into(),                          // 8
            "intent-filter".into(),                     // 9
            "action".into(),                            // 10
            "category".into(),                          // 11
            "android.intent.action.MAIN".into(),        // 12
            "android.intent.category.LAUNCHER".into(),  // 13
            ".MainActivity".into(),                     // 14
        ],
        styles: vec![],
    };
    let children = vec![
        Chunk::StringPool(pool),
        Chunk::XmlResourceMap(vec![0x0101_0003, 0x0101_0010]),
        Chunk::XmlStartNamespace(
            ResXmlNodeHeader::default(),
            ResXmlNamespace { prefix: 3, uri: NS },
        ),
        start(4, vec![attr(5, 6, -1)]),
        start(7, vec![]),
        start(8, vec![attr(0, 14, NS)]),
        start(9, vec![]),
        start(10, vec![attr(0, 12, NS)]),
        end(10),
        start(11, vec![attr(0, 13, NS)]),
        end(11),
        end(9),
        end(8),
        end(7),
        end(4),
        Chunk::XmlEndNamespace(
            ResXmlNodeHeader::default(),
            ResXmlNamespace { prefix: 3, uri: NS },
        ),
    ];
    let mut buf = vec![];
    Chunk::Xml(children)
        .write(&mut Cursor::new(&mut buf))
        .unwrap();
    buf
}

/// A resource-table stand-in. The pipeline only ever content-patches the
/// table through raw byte scans, so for tests it is enough that the buffer
/// carries the label and the icon variant paths at their physical widths.
pub fn template_resources() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x02, 0x00, 0x0c, 0x00]);
    buf.extend_from_slice(&[0u8; 28]);
    buf.extend_from_slice(TEMPLATE_LABEL.as_bytes());
    buf.push(0);
    for dir in ["mipmap-mdpi", "mipmap-xhdpi", "mipmap-xxxhdpi"] {
        buf.extend_from_slice(format!("res/{dir}/{ICON_STEM}.xml\0").as_bytes());
    }
    buf.extend_from_slice(&[0u8; 16]);
    buf
}

pub fn write_template(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default();
    writer.start_file("AndroidManifest.xml", options).unwrap();
    writer.write_all(&template_manifest()).unwrap();
    writer.start_file("resources.arsc", options).unwrap();
    writer.write_all(&template_resources()).unwrap();
    writer.start_file("classes.dex", options).unwrap();
    writer.write_all(b"dex\x00stand-in").unwrap();
    writer.finish().unwrap();
}
