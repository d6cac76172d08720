//! Module for building the matching keys of a C-MOVE request
//! from text terms and DICOM files.
use std::borrow::Cow;
use std::str::FromStr;

use dicom_core::dictionary::DataDictionary;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use snafu::{whatever, OptionExt, ResultExt, Whatever};

use crate::model::RetrieveLevel;

#[derive(Debug, Clone, Eq, Hash, PartialEq)]
struct TermQuery {
    field: Tag,
    match_value: String,
}

/// Term queries can be parsed with the syntax `«tag»=«value»`,
/// where `«tag»` is either a DICOM tag group-element pair
/// or the respective tag keyword,
/// and `=«value»` is optional.
impl FromStr for TermQuery {
    type Err = Whatever;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag_part, value_part) = s.split_once('=').unwrap_or((s, ""));
        let tag_part = tag_part.trim();
        if tag_part.is_empty() {
            whatever!("empty query");
        }

        let field: Tag = tag_part.parse().or_else(|_| {
            // look for tag in standard data dictionary
            let data_entry = StandardDataDictionary
                .by_name(tag_part)
                .whatever_context("could not resolve query field name")?;
            Ok::<_, Whatever>(data_entry.tag.inner())
        })?;

        Ok(TermQuery {
            field,
            match_value: value_part.to_owned(),
        })
    }
}

/// Look up the value representation of an attribute,
/// keyed by its tag and the private creator owning it.
///
/// Private creator elements are always `LO`.
/// Attributes of a private block have no registered dictionary,
/// and so are `UN`,
/// as are public attributes unknown to the standard dictionary.
pub fn vr_of(tag: Tag, private_creator: Option<&str>) -> VR {
    if tag.group() % 2 == 1 {
        return match (tag.element(), private_creator) {
            (0x0000, _) => VR::UL,
            (0x0010..=0x00FF, _) => VR::LO,
            // no private dictionaries are registered for any creator
            (_, Some(_)) | (_, None) => VR::UN,
        };
    }
    if tag.element() == 0x0000 {
        return VR::UL;
    }
    StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.vr.relaxed())
        .unwrap_or(VR::UN)
}

/// The collection of matching keys of a retrieve request,
/// plus the optional retrieve level.
///
/// The value representation of each key is always
/// resolved from the data dictionary.
#[derive(Debug, Clone)]
pub struct MatchKeys {
    obj: InMemDicomObject,
    level: Option<RetrieveLevel>,
}

impl Default for MatchKeys {
    fn default() -> Self {
        MatchKeys::new()
    }
}

impl MatchKeys {
    /// Create an empty set of matching keys.
    pub fn new() -> Self {
        MatchKeys {
            obj: InMemDicomObject::new_empty(),
            level: None,
        }
    }

    /// Add a key with the given textual value.
    /// An existing key with the same tag is replaced.
    pub fn add_key(&mut self, tag: Tag, value: &str) -> Result<(), Whatever> {
        let private_creator = self.private_creator_of(tag);
        let vr = vr_of(tag, private_creator.as_deref());
        let elem = term_to_element(tag, vr, value)?;
        self.obj.put(elem);
        Ok(())
    }

    /// Parse and add a key term in the form `«tag»=«value»`.
    pub fn add_term(&mut self, term: &str) -> Result<(), Whatever> {
        let term: TermQuery = term.parse()?;
        self.add_key(term.field, &term.match_value)
    }

    /// Parse and add all key terms in order.
    pub fn add_terms<T>(&mut self, terms: &[T]) -> Result<(), Whatever>
    where
        T: AsRef<str>,
    {
        for term in terms {
            let term = term.as_ref();
            self.add_term(term)
                .with_whatever_context(|_| format!("invalid query term `{}`", term))?;
        }
        Ok(())
    }

    /// Set the retrieve level.
    pub fn set_level(&mut self, level: RetrieveLevel) {
        self.level = Some(level);
    }

    /// The retrieve level, if any.
    pub fn level(&self) -> Option<RetrieveLevel> {
        self.level
    }

    /// Fetch a key by its tag.
    pub fn get(&self, tag: Tag) -> Option<&InMemElement> {
        self.obj.get(tag)
    }

    /// Whether no keys nor retrieve level were defined.
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && (&self.obj).into_iter().next().is_none()
    }

    /// Build the identifier data set containing only these keys.
    pub fn to_identifier(&self) -> InMemDicomObject {
        self.overlay_on(InMemDicomObject::new_empty())
    }

    /// Build an identifier data set from a base data set
    /// (typically read from a file),
    /// overriding its attributes with these keys.
    pub fn overlay_on(&self, base: InMemDicomObject) -> InMemDicomObject {
        let mut obj = base;
        for elem in &self.obj {
            obj.put(elem.clone());
        }
        if let Some(level) = self.level {
            obj.put(DataElement::new(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                PrimitiveValue::from(level.as_str()),
            ));
        }
        obj
    }

    fn private_creator_of(&self, tag: Tag) -> Option<String> {
        if tag.group() % 2 == 0 || tag.element() < 0x1000 {
            return None;
        }
        let creator_tag = Tag(tag.group(), tag.element() >> 8);
        self.obj
            .get(creator_tag)
            .and_then(|e| e.to_str().ok())
            .map(Cow::into_owned)
    }
}

fn term_to_element(tag: Tag, vr: VR, txt_value: &str) -> Result<InMemElement, Whatever> {
    let value = match vr {
        VR::AE
        | VR::AS
        | VR::CS
        | VR::DA
        | VR::DS
        | VR::IS
        | VR::LO
        | VR::LT
        | VR::SH
        | VR::PN
        | VR::ST
        | VR::TM
        | VR::UI
        | VR::UC
        | VR::UR
        | VR::UT
        | VR::DT
        | VR::UN => PrimitiveValue::from(txt_value),
        VR::AT => whatever!("Unsupported VR AT"),
        VR::OB => whatever!("Unsupported VR OB"),
        VR::OD => whatever!("Unsupported VR OD"),
        VR::OF => whatever!("Unsupported VR OF"),
        VR::OL => whatever!("Unsupported VR OL"),
        VR::OV => whatever!("Unsupported VR OV"),
        VR::OW => whatever!("Unsupported VR OW"),
        VR::SQ => whatever!("Unsupported sequence-based key"),
        VR::SS => {
            let ss: i16 = txt_value
                .parse()
                .whatever_context("Failed to parse value as SS")?;
            PrimitiveValue::from(ss)
        }
        VR::SL => {
            let sl: i32 = txt_value
                .parse()
                .whatever_context("Failed to parse value as SL")?;
            PrimitiveValue::from(sl)
        }
        VR::SV => {
            let sv: i64 = txt_value
                .parse()
                .whatever_context("Failed to parse value as SV")?;
            PrimitiveValue::from(sv)
        }
        VR::US => {
            let us: u16 = txt_value
                .parse()
                .whatever_context("Failed to parse value as US")?;
            PrimitiveValue::from(us)
        }
        VR::UL => {
            let ul: u32 = txt_value
                .parse()
                .whatever_context("Failed to parse value as UL")?;
            PrimitiveValue::from(ul)
        }
        VR::UV => {
            let uv: u64 = txt_value
                .parse()
                .whatever_context("Failed to parse value as UV")?;
            PrimitiveValue::from(uv)
        }
        VR::FL => {
            let fl: f32 = txt_value
                .parse()
                .whatever_context("Failed to parse value as FL")?;
            PrimitiveValue::from(fl)
        }
        VR::FD => {
            let fd: f64 = txt_value
                .parse()
                .whatever_context("Failed to parse value as FD")?;
            PrimitiveValue::from(fd)
        }
    };
    Ok(DataElement::new(tag, vr, value))
}

#[cfg(test)]
mod tests {
    use dicom_core::header::Header;

    use super::*;

    fn str_value(obj: &InMemDicomObject, tag: Tag) -> String {
        obj.get(tag)
            .expect("attribute should be present")
            .to_str()
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn parse_terms_by_keyword_and_tag() {
        let mut keys = MatchKeys::new();
        keys.add_terms(&["StudyInstanceUID=1.2.3", "(0010,0020)=P01", "00100010=DOE^J"])
            .unwrap();

        let obj = keys.to_identifier();
        assert_eq!(str_value(&obj, tags::STUDY_INSTANCE_UID), "1.2.3");
        assert_eq!(str_value(&obj, tags::PATIENT_ID), "P01");
        assert_eq!(str_value(&obj, tags::PATIENT_NAME), "DOE^J");
    }

    #[test]
    fn vr_comes_from_dictionary() {
        let mut keys = MatchKeys::new();
        keys.add_terms(&["StudyInstanceUID=1.2.3", "NumberOfStudyRelatedInstances=4"])
            .unwrap();

        assert_eq!(keys.get(tags::STUDY_INSTANCE_UID).unwrap().vr(), VR::UI);
        let elem = keys.get(tags::NUMBER_OF_STUDY_RELATED_INSTANCES).unwrap();
        assert_eq!(elem.vr(), VR::IS);
    }

    #[test]
    fn vr_of_private_attributes() {
        assert_eq!(vr_of(Tag(0x0009, 0x0010), None), VR::LO);
        assert_eq!(vr_of(Tag(0x0009, 0x1001), Some("ACME 1.0")), VR::UN);
        assert_eq!(vr_of(Tag(0x0008, 0x0000), None), VR::UL);
        assert_eq!(vr_of(tags::QUERY_RETRIEVE_LEVEL, None), VR::CS);
    }

    #[test]
    fn empty_value_for_universal_matching() {
        let mut keys = MatchKeys::new();
        keys.add_term("PatientID").unwrap();
        let obj = keys.to_identifier();
        assert_eq!(str_value(&obj, tags::PATIENT_ID), "");
    }

    #[test]
    fn bad_terms() {
        let mut keys = MatchKeys::new();
        assert!(keys.add_term("NotAnAttribute=1").is_err());
        assert!(keys.add_term("=1").is_err());
        assert!(keys.add_term("NumberOfStudyRelatedSeries=abc").is_ok());
        assert!(keys.add_term("(0028,0010)=abc").is_err());
    }

    #[test]
    fn level_is_written_into_identifier() {
        let mut keys = MatchKeys::new();
        assert!(keys.is_empty());
        keys.set_level(RetrieveLevel::Series);
        assert!(!keys.is_empty());
        let obj = keys.to_identifier();
        assert_eq!(str_value(&obj, tags::QUERY_RETRIEVE_LEVEL), "SERIES");
    }

    #[test]
    fn caller_keys_override_base_attributes() {
        let base = InMemDicomObject::from_element_iter([
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("9.9.9")),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("FROM-FILE")),
        ]);

        let mut keys = MatchKeys::new();
        keys.add_term("StudyInstanceUID=1.2.3").unwrap();
        keys.set_level(RetrieveLevel::Study);

        let obj = keys.overlay_on(base.clone());
        assert_eq!(str_value(&obj, tags::STUDY_INSTANCE_UID), "1.2.3");
        assert_eq!(str_value(&obj, tags::PATIENT_ID), "FROM-FILE");
        assert_eq!(str_value(&obj, tags::QUERY_RETRIEVE_LEVEL), "STUDY");

        // the keys and the base are left untouched
        assert_eq!(str_value(&base, tags::STUDY_INSTANCE_UID), "9.9.9");
        assert!(keys.get(tags::PATIENT_ID).is_none());
    }
}
