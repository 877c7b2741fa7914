//! NDA document rendering.
//!
//! Output is a PDF whose content streams are left uncompressed, so every signatory value
//! appears verbatim in the file bytes, WinAnsi encoded. Values the standard fonts cannot
//! print are refused rather than substituted.

use crate::error::OnboardError;
use crate::signature::SignatureRaster;
use crate::types::SignatoryData;
use chrono::{Datelike, NaiveDate};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

pub const DEFAULT_TEMPLATE_ID: &str = "nda-v1";

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 56;
const LINE_HEIGHT: i64 = 14;
const BODY_SIZE: i64 = 10;
const HEADING_SIZE: i64 = 14;
const WRAP_COLUMNS: usize = 92;
const SIGNATURE_BOX_WIDTH: i64 = 240;
const SIGNATURE_BOX_HEIGHT: i64 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    #[default]
    Pt,
    En,
}

impl FromStr for Locale {
    type Err = OnboardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pt" | "pt-pt" | "pt_pt" => Ok(Self::Pt),
            "en" | "en-gb" | "en-us" => Ok(Self::En),
            other => Err(OnboardError::Validation(format!(
                "unsupported locale '{other}'; expected pt or en"
            ))),
        }
    }
}

/// Text available in every supported locale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedText {
    pub pt: String,
    pub en: String,
}

impl LocalizedText {
    pub fn new(pt: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            pt: pt.into(),
            en: en.into(),
        }
    }

    pub fn get(&self, locale: Locale) -> &str {
        match locale {
            Locale::Pt => &self.pt,
            Locale::En => &self.en,
        }
    }
}

/// Legal template. `parties` may reference signatory fields as `{fieldName}`.
#[derive(Debug, Clone)]
pub struct NdaTemplate {
    pub id: String,
    pub version: String,
    pub title: LocalizedText,
    pub parties: LocalizedText,
    pub clauses: Vec<LocalizedText>,
}

impl NdaTemplate {
    pub fn standard() -> Self {
        Self {
            id: DEFAULT_TEMPLATE_ID.to_string(),
            version: "1.0".to_string(),
            title: LocalizedText::new(
                "ACORDO DE CONFIDENCIALIDADE",
                "NON-DISCLOSURE AGREEMENT",
            ),
            parties: LocalizedText::new(
                "{fullName}, de nacionalidade {nationality}, estado civil {maritalStatus}, \
                 profissão {profession}, residente em {address}, portador(a) do documento \
                 {documentType} n.º {documentNumber}, NIF {taxId}, em representação de \
                 {companyName} na qualidade de {companyRole}, contactável em {email} e \
                 {phone}, doravante designado(a) Destinatário.",
                "{fullName}, a {nationality} national, {maritalStatus}, {profession}, \
                 residing at {address}, holder of {documentType} no. {documentNumber}, tax \
                 id {taxId}, acting for {companyName} as {companyRole}, reachable at {email} \
                 and {phone}, hereinafter the Recipient.",
            ),
            clauses: vec![
                LocalizedText::new(
                    "1. O Destinatário compromete-se a manter estritamente confidencial toda a \
                     informação a que tenha acesso na área reservada a investidores.",
                    "1. The Recipient shall keep strictly confidential all information made \
                     available in the restricted investor area.",
                ),
                LocalizedText::new(
                    "2. A informação confidencial apenas pode ser usada para avaliar uma \
                     potencial participação no investimento.",
                    "2. Confidential information may only be used to evaluate a potential \
                     participation in the investment.",
                ),
                LocalizedText::new(
                    "3. O Destinatário não pode divulgar, copiar ou transmitir a informação \
                     a terceiros sem autorização prévia e escrita.",
                    "3. The Recipient shall not disclose, copy or transmit the information to \
                     third parties without prior written consent.",
                ),
                LocalizedText::new(
                    "4. As obrigações deste acordo mantêm-se por um período de cinco anos \
                     após a data de assinatura.",
                    "4. The obligations of this agreement survive for five years after the \
                     signature date.",
                ),
                LocalizedText::new(
                    "5. O Destinatário reconhece que a assinatura eletrónica aposta, a \
                     verificação do telefone e o endereço IP registado o identificam.",
                    "5. The Recipient acknowledges that the electronic signature, the verified \
                     phone number and the recorded IP address identify them.",
                ),
                LocalizedText::new(
                    "6. Este acordo rege-se pela lei portuguesa.",
                    "6. This agreement is governed by Portuguese law.",
                ),
            ],
        }
    }
}

/// Templates keyed by id.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, NdaTemplate>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(NdaTemplate::standard());
        registry
    }
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, template: NdaTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<&NdaTemplate> {
        self.templates.get(id)
    }
}

/// Renders signed NDA documents.
#[derive(Debug, Clone)]
pub struct DocumentGenerator {
    templates: TemplateRegistry,
    location: String,
}

impl DocumentGenerator {
    pub fn new(templates: TemplateRegistry, location: impl Into<String>) -> Self {
        Self {
            templates,
            location: location.into(),
        }
    }

    pub fn template(&self, id: &str) -> Option<&NdaTemplate> {
        self.templates.get(id)
    }

    pub fn render(
        &self,
        template_id: &str,
        signatory: &SignatoryData,
        signature: &SignatureRaster,
        issued_date: NaiveDate,
        locale: Locale,
    ) -> Result<Vec<u8>, OnboardError> {
        let template = self.templates.get(template_id).ok_or_else(|| {
            OnboardError::Storage(format!("unknown document template '{template_id}'"))
        })?;
        if signature.is_empty() {
            return Err(OnboardError::Validation(
                "cannot render an agreement without a signature".to_string(),
            ));
        }
        ensure_signatory_printable(signatory)?;

        let mut layout = Layout::new();
        layout.text(Font::Bold, HEADING_SIZE, template.title.get(locale));
        layout.gap();
        for line in wrap(&fill_placeholders(template.parties.get(locale), signatory)) {
            layout.body(&line);
        }
        layout.gap();
        for clause in &template.clauses {
            for line in wrap(&[Segment::Text(clause.get(locale).to_string())]) {
                layout.body(&line);
            }
            layout.gap();
        }

        layout.body(&format!(
            "{}, {}",
            self.location,
            format_long_date(issued_date, locale)
        ));
        layout.gap();
        let caption = match locale {
            Locale::Pt => "Assinatura do Destinatário",
            Locale::En => "Recipient signature",
        };
        layout.text(Font::Bold, BODY_SIZE, caption);
        layout.signature_box();
        layout.body(&signatory.full_name);
        layout.body(&format!(
            "{}: {}",
            match locale {
                Locale::Pt => "Data de assinatura",
                Locale::En => "Signature date",
            },
            signatory.signature_date
        ));
        layout.body(&format!(
            "{} {} / {}",
            template.id, template.version, signatory.document_version
        ));

        build_pdf(layout, template, signatory, signature, issued_date)
    }
}

fn format_long_date(date: NaiveDate, locale: Locale) -> String {
    const PT_MONTHS: [&str; 12] = [
        "janeiro", "fevereiro", "março", "abril", "maio", "junho", "julho", "agosto",
        "setembro", "outubro", "novembro", "dezembro",
    ];
    const EN_MONTHS: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August",
        "September", "October", "November", "December",
    ];
    let month = date.month0() as usize;
    match locale {
        Locale::Pt => format!("{} de {} de {}", date.day(), PT_MONTHS[month], date.year()),
        Locale::En => format!("{} {}, {}", EN_MONTHS[month], date.day(), date.year()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    /// Signatory value; never split across lines.
    Value(String),
}

fn fill_placeholders(template: &str, signatory: &SignatoryData) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let key = &rest[start + 1..start + len];
        match field_value(signatory, key) {
            Some(value) => segments.push(Segment::Value(value)),
            None => segments.push(Segment::Text(rest[start..=start + len].to_string())),
        }
        rest = &rest[start + len + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    segments
}

fn field_value(signatory: &SignatoryData, key: &str) -> Option<String> {
    let value = match key {
        "fullName" => &signatory.full_name,
        "nationality" => &signatory.nationality,
        "maritalStatus" => &signatory.marital_status,
        "profession" => &signatory.profession,
        "address" => &signatory.address,
        "documentType" => return Some(signatory.document_type.label().to_string()),
        "documentNumber" => &signatory.document_number,
        "taxId" => &signatory.tax_id,
        "phone" => &signatory.phone,
        "signatureDate" => &signatory.signature_date,
        "documentVersion" => &signatory.document_version,
        "companyName" => &signatory.company_name,
        "companyRole" => &signatory.company_role,
        "email" => &signatory.email,
        _ => return None,
    };
    Some(value.trim().to_string())
}

/// Greedy wrap at `WRAP_COLUMNS`; values stay whole and carry adjacent punctuation.
fn wrap(segments: &[Segment]) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => {
                let glued = text.starts_with(|c: char| !c.is_whitespace());
                for (i, word) in text.split_whitespace().enumerate() {
                    match words.last_mut() {
                        Some(last) if i == 0 && glued => last.push_str(word),
                        _ => words.push(word.to_string()),
                    }
                }
                if text.ends_with(char::is_whitespace) {
                    words.push(String::new());
                }
            }
            Segment::Value(value) => match words.last_mut() {
                Some(last) if !last.is_empty() => last.push_str(value),
                Some(last) => last.push_str(value),
                None => words.push(value.clone()),
            },
        }
    }

    let mut lines = Vec::new();
    let mut current = String::new();
    for word in words.into_iter().filter(|w| !w.is_empty()) {
        if !current.is_empty() && current.len() + 1 + word.len() > WRAP_COLUMNS {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// WinAnsiEncoding code for `c`, if the standard fonts can print it.
fn win_ansi_byte(c: char) -> Option<u8> {
    let byte = match c {
        ' '..='~' | '\u{a0}'..='\u{ff}' => c as u32 as u8,
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8a,
        '‹' => 0x8b,
        'Œ' => 0x8c,
        'Ž' => 0x8e,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9a,
        '›' => 0x9b,
        'œ' => 0x9c,
        'ž' => 0x9e,
        'Ÿ' => 0x9f,
        _ => return None,
    };
    Some(byte)
}

/// Distinct characters of `text` the agreement fonts cannot print.
pub fn unprintable_chars(text: &str) -> Vec<char> {
    let mut found: Vec<char> = Vec::new();
    for c in text.chars().filter(|c| win_ansi_byte(*c).is_none()) {
        if !found.contains(&c) {
            found.push(c);
        }
    }
    found
}

/// `Validation` error naming `field` when `value` holds unprintable characters.
pub fn ensure_printable(field: &str, value: &str) -> Result<(), OnboardError> {
    let unprintable = unprintable_chars(value);
    if unprintable.is_empty() {
        return Ok(());
    }
    let listed = unprintable
        .iter()
        .map(char::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    Err(OnboardError::Validation(format!(
        "{field} contains characters that cannot be printed on the agreement: {listed}"
    )))
}

/// Only called on template text and on values that passed `ensure_printable`.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars().filter_map(win_ansi_byte).collect()
}

fn ensure_signatory_printable(signatory: &SignatoryData) -> Result<(), OnboardError> {
    for (field, value) in [
        ("fullName", &signatory.full_name),
        ("nationality", &signatory.nationality),
        ("maritalStatus", &signatory.marital_status),
        ("profession", &signatory.profession),
        ("address", &signatory.address),
        ("documentNumber", &signatory.document_number),
        ("taxId", &signatory.tax_id),
        ("phone", &signatory.phone),
        ("companyName", &signatory.company_name),
        ("companyRole", &signatory.company_role),
        ("email", &signatory.email),
        ("documentVersion", &signatory.document_version),
    ] {
        ensure_printable(field, value)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Font {
    Regular,
    Bold,
}

impl Font {
    fn resource(self) -> &'static str {
        match self {
            Self::Regular => "F1",
            Self::Bold => "F2",
        }
    }
}

struct Layout {
    pages: Vec<Vec<Operation>>,
    y: i64,
}

impl Layout {
    fn new() -> Self {
        Self {
            pages: vec![Vec::new()],
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn ensure_room(&mut self, height: i64) {
        if self.y - height < MARGIN {
            self.pages.push(Vec::new());
            self.y = PAGE_HEIGHT - MARGIN;
        }
    }

    fn ops(&mut self) -> &mut Vec<Operation> {
        // `pages` is never empty.
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn text(&mut self, font: Font, size: i64, text: &str) {
        let line_height = LINE_HEIGHT.max(size + 4);
        self.ensure_room(line_height);
        self.y -= line_height;

        // Overlong unbreakable lines shrink instead of running off the page.
        let size = if text.len() > WRAP_COLUMNS {
            (size * WRAP_COLUMNS as i64 / text.len() as i64).max(6)
        } else {
            size
        };
        let y = self.y;
        self.ops().extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![font.resource().into(), size.into()]),
            Operation::new("Td", vec![MARGIN.into(), y.into()]),
            Operation::new("Tj", vec![Object::string_literal(encode_win_ansi(text))]),
            Operation::new("ET", vec![]),
        ]);
    }

    fn body(&mut self, text: &str) {
        self.text(Font::Regular, BODY_SIZE, text);
    }

    fn gap(&mut self) {
        self.y -= LINE_HEIGHT / 2;
    }

    fn signature_box(&mut self) {
        self.ensure_room(SIGNATURE_BOX_HEIGHT + LINE_HEIGHT);
        self.y -= SIGNATURE_BOX_HEIGHT + 4;
        let y = self.y;
        self.ops().extend([
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    SIGNATURE_BOX_WIDTH.into(),
                    0.into(),
                    0.into(),
                    SIGNATURE_BOX_HEIGHT.into(),
                    MARGIN.into(),
                    y.into(),
                ],
            ),
            Operation::new("Do", vec!["Sig".into()]),
            Operation::new("Q", vec![]),
        ]);
    }
}

fn build_pdf(
    layout: Layout,
    template: &NdaTemplate,
    signatory: &SignatoryData,
    signature: &SignatureRaster,
    issued_date: NaiveDate,
) -> Result<Vec<u8>, OnboardError> {
    let pdf_err = |e: lopdf::Error| OnboardError::Storage(format!("pdf generation failed: {e}"));

    let mut doc = Document::with_version("1.5");
    let pages_id: ObjectId = doc.new_object_id();

    let regular_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => signature.width as i64,
            "Height" => signature.height as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        signature.deflate()?,
    ));
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => regular_id,
            "F2" => bold_id,
        },
        "XObject" => dictionary! {
            "Sig" => image_id,
        },
    });

    let mut kids: Vec<Object> = Vec::with_capacity(layout.pages.len());
    for operations in layout.pages {
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().map_err(pdf_err)?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal(encode_win_ansi(template.title.en.as_str())),
        "Author" => Object::string_literal(encode_win_ansi(&signatory.full_name)),
        "Subject" => Object::string_literal(format!("{} {}", template.id, template.version)),
        "Producer" => Object::string_literal("onboard-core"),
        "CreationDate" => Object::string_literal(format!(
            "D:{}000000Z",
            issued_date.format("%Y%m%d")
        )),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| OnboardError::Storage(format!("pdf serialization failed: {e}")))?;
    Ok(bytes)
}
