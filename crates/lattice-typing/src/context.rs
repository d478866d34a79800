//! The typing context: tables of files, types and interfaces, plus the
//! generic instantiation machinery.
//!
//! Tables are populated during the load phase and effectively read-only
//! while serving; contexts are explicit so tests can spin up isolated
//! instances.

use std::collections::HashMap;
use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use lattice_core::{Object, ObjectKind, RpcError};
use tracing::debug;

use crate::file::IdlFile;
use crate::grammar::{
    split_type_list, EVENT_REGEX, INSTANCE_REGEX, INTERFACE_REGEX, METHOD_REGEX,
    PROPERTY_REGEX, TYPE_REGEX,
};
use crate::interface::{AccessRights, Argument, IfMember, IfMemberKind, Interface};
use crate::types::{Member, Type, TypeClass, TypeInstance, BUILTIN_TYPES};

/// Name of the built-in typing discovery interface.
pub const TYPING_INTERFACE: &str = "com.twoporeguys.librpc.Typing";

/// Lexical scope used while instantiating nested generic variables.
pub(crate) struct Scope<'a> {
    pub ty: &'a Arc<Type>,
    pub specializations: &'a HashMap<String, TypeInstance>,
    pub up: Option<&'a Scope<'a>>,
}

/// Registry of IDL files, types and interfaces.
pub struct TypingContext {
    files: RwLock<HashMap<PathBuf, Arc<IdlFile>>>,
    types: RwLock<HashMap<String, Arc<Type>>>,
    interfaces: RwLock<HashMap<String, Arc<Interface>>>,
    /// Canonical form -> shared instance, for non-generic types.
    cache: Mutex<HashMap<String, TypeInstance>>,
}

impl TypingContext {
    /// Create a context seeded with the builtin types.
    pub fn new() -> Arc<Self> {
        let ctx = Self {
            files: RwLock::new(HashMap::new()),
            types: RwLock::new(HashMap::new()),
            interfaces: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        };

        {
            let mut types = ctx.types.write().unwrap();
            for name in BUILTIN_TYPES {
                types.insert(
                    name.to_string(),
                    Arc::new(Type {
                        name: name.to_string(),
                        description: format!("builtin {} type", name),
                        class: TypeClass::Builtin,
                        file: None,
                        origin: String::new(),
                        parent: None,
                        generic_vars: Vec::new(),
                        members: HashMap::new(),
                        constraints: Arc::new(HashMap::new()),
                        definition: None,
                    }),
                );
            }
        }

        Arc::new(ctx)
    }

    // File loading.

    /// Read and register an IDL file without parsing its declarations.
    /// Loading an already-registered path returns the existing entry.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<IdlFile>, RpcError> {
        let path = path.as_ref().to_path_buf();

        if let Some(file) = self.files.read().unwrap().get(&path) {
            debug!(path = %path.display(), "file already loaded");
            return Ok(file.clone());
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| RpcError::invalid(format!("{}: {}", path.display(), e)))?;
        let body = lattice_core::load("yaml", contents.as_bytes())?;

        self.register_document(path, body, Some(contents))
    }

    /// Register an already-decoded document body, e.g. one pulled through
    /// the typing discovery service.
    pub fn load_document(
        &self,
        path: impl AsRef<Path>,
        body: Object,
    ) -> Result<Arc<IdlFile>, RpcError> {
        let path = path.as_ref().to_path_buf();
        if let Some(file) = self.files.read().unwrap().get(&path) {
            return Ok(file.clone());
        }
        self.register_document(path, body, None)
    }

    fn register_document(
        &self,
        path: PathBuf,
        body: Object,
        source: Option<String>,
    ) -> Result<Arc<IdlFile>, RpcError> {
        let file = Arc::new(IdlFile::new(path.clone(), body, source)?);
        self.files.write().unwrap().insert(path, file.clone());
        Ok(file)
    }

    /// Load an IDL file and parse every declaration in it.
    pub fn load_types(&self, path: impl AsRef<Path>) -> Result<(), RpcError> {
        let path = path.as_ref();
        let file = self.load_file(path)?;

        let mut failure = None;
        file.body.dict_apply(|key, value| {
            if key == "meta" {
                return true;
            }

            let result = if key.starts_with("interface") {
                self.read_interface(&file, key, value)
            } else {
                self.read_type(&file, key, value)
            };

            match result {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        });

        match failure {
            Some(e) => Err(RpcError::new(
                e.code,
                format!("{}: {}", path.display(), e.message),
            )),
            None => Ok(()),
        }
    }

    /// Recursively load every `*.yaml` file under a directory. Files are
    /// registered first and parsed afterwards so cross-file references
    /// chain-load.
    pub fn load_types_dir(&self, path: impl AsRef<Path>) -> Result<(), RpcError> {
        let path = path.as_ref();
        let entries = fs::read_dir(path)
            .map_err(|e| RpcError::invalid(format!("{}: {}", path.display(), e)))?;

        let mut pending = Vec::new();
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                self.load_types_dir(&entry_path)?;
                continue;
            }

            if entry_path.extension().map_or(true, |ext| ext != "yaml") {
                continue;
            }

            if self.load_file(&entry_path).is_err() {
                continue;
            }

            pending.push(entry_path);
        }

        for entry_path in pending {
            self.load_types(&entry_path)?;
        }

        Ok(())
    }

    /// Loading definitions from a stream is not implemented.
    pub fn load_types_stream(&self, _fd: RawFd) -> Result<(), RpcError> {
        Err(RpcError::not_supported("Not implemented"))
    }

    /// Iterate loaded files; the callback returns `true` to keep going.
    pub fn files_apply<F: FnMut(&Arc<IdlFile>) -> bool>(&self, mut f: F) -> bool {
        let files: Vec<_> = self.files.read().unwrap().values().cloned().collect();
        for file in &files {
            if !f(file) {
                return true;
            }
        }
        false
    }

    // Lookups.

    /// Look up a type by fully qualified name. On a table miss, scans
    /// registered file bodies for a matching declaration and parses it on
    /// demand.
    pub fn find_type(&self, name: &str) -> Option<Arc<Type>> {
        if let Some(ty) = self.types.read().unwrap().get(name) {
            return Some(ty.clone());
        }

        debug!(name, "type not found, trying to chain-load it");
        if let Some((file, decl, obj)) = self.lookup_declaration(name) {
            let _ = self.read_type(&file, &decl, &obj);
        }

        self.types.read().unwrap().get(name).cloned()
    }

    /// Verbatim lookup, then `<namespace>.<name>`, then each `use` prefix.
    pub fn find_type_fuzzy(&self, name: &str, origin: Option<&Arc<IdlFile>>) -> Option<Arc<Type>> {
        if let Some(ty) = self.find_type(name) {
            return Some(ty);
        }

        let origin = origin?;

        if origin.namespace.is_some() {
            if let Some(ty) = self.find_type(&origin.qualify(name)) {
                return Some(ty);
            }
        }

        for prefix in &origin.uses {
            if let Some(ty) = self.find_type(&format!("{}.{}", prefix, name)) {
                return Some(ty);
            }
        }

        None
    }

    fn lookup_declaration(&self, name: &str) -> Option<(Arc<IdlFile>, String, Object)> {
        let files: Vec<_> = self.files.read().unwrap().values().cloned().collect();

        for file in files {
            let mut found = None;
            file.body.dict_apply(|key, value| {
                let Some(caps) = TYPE_REGEX.captures(key) else {
                    return true;
                };

                if file.qualify(&caps[2]) == name {
                    found = Some((key.to_string(), value.clone()));
                    return false;
                }
                true
            });

            if let Some((decl, obj)) = found {
                return Some((file, decl, obj));
            }
        }

        None
    }

    pub fn find_interface(&self, name: &str) -> Result<Arc<Interface>, RpcError> {
        self.interfaces
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::not_found("Interface not found"))
    }

    /// Look up a member of a named interface.
    pub fn find_if_member(&self, interface: &str, member: &str) -> Result<Arc<IfMember>, RpcError> {
        let iface = self.find_interface(interface)?;
        iface
            .member(member)
            .cloned()
            .ok_or_else(|| RpcError::not_found("Member not found"))
    }

    /// Iterate defined types; the callback returns `true` to keep going.
    /// Returns `true` if stopped early.
    pub fn types_apply<F: FnMut(&Arc<Type>) -> bool>(&self, mut f: F) -> bool {
        let types: Vec<_> = self.types.read().unwrap().values().cloned().collect();
        for ty in &types {
            if !f(ty) {
                return true;
            }
        }
        false
    }

    /// Iterate defined interfaces; same stop protocol as `types_apply`.
    pub fn interfaces_apply<F: FnMut(&Arc<Interface>) -> bool>(&self, mut f: F) -> bool {
        let interfaces: Vec<_> = self.interfaces.read().unwrap().values().cloned().collect();
        for iface in &interfaces {
            if !f(iface) {
                return true;
            }
        }
        false
    }

    // Instantiation.

    /// Instantiate a type declaration, e.g. `HashMap<string,double>`.
    pub fn instantiate(&self, decl: &str) -> Result<TypeInstance, RpcError> {
        self.instantiate_in(decl, None, None, None)
    }

    pub(crate) fn instantiate_in(
        &self,
        decl: &str,
        scope: Option<&Scope<'_>>,
        proxy_vars: Option<&[String]>,
        origin: Option<&Arc<IdlFile>>,
    ) -> Result<TypeInstance, RpcError> {
        let decl = decl.trim();
        debug!(decl, "instantiating type");

        let caps = INSTANCE_REGEX
            .captures(decl)
            .ok_or_else(|| RpcError::invalid(format!("Invalid type specification: {}", decl)))?;
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let vars = caps.get(3).map(|m| m.as_str());

        let ty = self.find_type_fuzzy(name, origin);

        let Some(ty) = ty else {
            // Maybe it's a generic variable bound in an enclosing scope.
            let mut cur = scope;
            while let Some(s) = cur {
                if s.ty.is_generic() {
                    if let Some(bound) = s.specializations.get(name) {
                        return Ok(bound.clone());
                    }
                }
                cur = s.up;
            }

            // Or a placeholder variable of the type being defined.
            if proxy_vars.is_some_and(|vars| vars.iter().any(|v| v == name)) {
                return Ok(TypeInstance::proxy(name));
            }

            return Err(RpcError::invalid(format!("Type {} not found", decl)));
        };

        if !ty.is_generic() {
            let mut cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&ty.name) {
                return Ok(cached.clone());
            }

            let instance =
                TypeInstance::concrete(ty.clone(), HashMap::new(), ty.constraints.clone());
            cache.insert(ty.name.clone(), instance.clone());
            return Ok(instance);
        }

        let vars = vars.ok_or_else(|| {
            RpcError::invalid(format!("Invalid generic variable specification: {}", decl))
        })?;
        let split = split_type_list(vars);

        if split.len() != ty.generic_vars.len() {
            return Err(RpcError::invalid(format!(
                "Generic variable count mismatch in {}",
                decl
            )));
        }

        let mut specializations = HashMap::new();
        for (var, var_decl) in ty.generic_vars.iter().zip(&split) {
            let inner = Scope {
                ty: &ty,
                specializations: &specializations,
                up: scope,
            };
            let subtype = self
                .instantiate_in(var_decl, Some(&inner), proxy_vars, origin)
                .map_err(|e| {
                    RpcError::new(
                        e.code,
                        format!("Cannot instantiate generic type {} in {}: {}", var_decl, name, e.message),
                    )
                })?;
            specializations.insert(var.clone(), subtype);
        }

        Ok(TypeInstance::concrete(
            ty.clone(),
            specializations,
            ty.constraints.clone(),
        ))
    }

    /// Instantiate the type of a member at a realized site: generic
    /// variables resolve through `typei`'s specializations and the member
    /// site's constraints replace the type's own.
    pub fn member_type(
        &self,
        typei: &TypeInstance,
        member: &Member,
    ) -> Result<TypeInstance, RpcError> {
        let decl = member
            .typei
            .as_ref()
            .ok_or_else(|| RpcError::invalid(format!("Member {} is untyped", member.name)))?;
        let ty = typei
            .ty()
            .ok_or_else(|| RpcError::invalid("Cannot take a member of a proxy type"))?;

        let origin = ty
            .file
            .as_ref()
            .and_then(|path| self.files.read().unwrap().get(path).cloned());

        let empty = HashMap::new();
        let scope = Scope {
            ty,
            specializations: typei.specializations().unwrap_or(&empty),
            up: None,
        };

        let instance =
            self.instantiate_in(decl.canonical_form(), Some(&scope), None, origin.as_ref())?;
        Ok(instance.with_constraints(member.constraints.clone()))
    }

    // Declaration parsing.

    pub(crate) fn read_type(
        &self,
        file: &Arc<IdlFile>,
        decl: &str,
        obj: &Object,
    ) -> Result<(), RpcError> {
        debug!(decl, path = %file.path.display(), "reading type");

        let caps = TYPE_REGEX
            .captures(decl)
            .ok_or_else(|| RpcError::invalid(format!("Syntax error: {}", decl)))?;
        let class = TypeClass::from_decl(&caps[1])
            .ok_or_else(|| RpcError::invalid(format!("Unknown class handler: {}", &caps[1])))?;
        let local_name = caps[2].to_string();
        let generic_vars: Vec<String> = caps
            .get(4)
            .map(|m| split_type_list(m.as_str()))
            .unwrap_or_default();

        let name = file.qualify(&local_name);

        // Re-declaring an existing type is a no-op.
        if self.types.read().unwrap().contains_key(&name) {
            return Ok(());
        }

        let description = obj
            .dict_get("description")
            .and_then(|d| d.as_str().map(str::to_string))
            .unwrap_or_default();

        let parent = match obj.dict_get("inherits").and_then(|v| v.as_str().map(str::to_string)) {
            Some(inherits) => Some(self.find_type_fuzzy(&inherits, Some(file)).ok_or_else(
                || RpcError::not_found(format!("Cannot find parent type: {}", inherits)),
            )?),
            None => None,
        };

        let mut members = HashMap::new();
        if let Some(parent) = &parent {
            for (key, member) in &parent.members {
                members.insert(
                    key.clone(),
                    Member {
                        name: member.name.clone(),
                        description: member.description.clone(),
                        typei: member.typei.clone(),
                        constraints: member.constraints.clone(),
                    },
                );
            }
        }

        if let Some(decls) = obj.dict_get("members") {
            for member in self.read_members(file, class, &generic_vars, &decls)? {
                members.insert(member.name.clone(), member);
            }
        }

        let constraints = read_constraints(obj);

        let (class, definition) = match obj
            .dict_get("type")
            .and_then(|v| v.as_str().map(str::to_string))
        {
            Some(def) => {
                let definition =
                    self.instantiate_in(&def, None, Some(generic_vars.as_slice()), Some(file))?;
                (TypeClass::Typedef, Some(definition))
            }
            None => (class, None),
        };

        let ty = Arc::new(Type {
            name: name.clone(),
            description,
            class,
            file: Some(file.path.clone()),
            origin: file.origin_for(obj),
            parent,
            generic_vars,
            members,
            constraints,
            definition,
        });

        self.types.write().unwrap().insert(name.clone(), ty);
        debug!(name = %name, "inserted type");
        Ok(())
    }

    fn read_members(
        &self,
        file: &Arc<IdlFile>,
        class: TypeClass,
        generic_vars: &[String],
        decls: &Object,
    ) -> Result<Vec<Member>, RpcError> {
        let mut members = Vec::new();

        match class {
            TypeClass::Struct | TypeClass::Union => {
                let mut failure = None;
                decls.dict_apply(|key, value| {
                    match self.read_typed_member(file, generic_vars, key, value) {
                        Ok(member) => {
                            members.push(member);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    }
                });
                if let Some(e) = failure {
                    return Err(e);
                }
            }
            TypeClass::Enum => {
                decls.array_apply(|_, tag| {
                    if let Some(tag) = tag.as_str() {
                        members.push(Member {
                            name: tag.to_string(),
                            description: String::new(),
                            typei: None,
                            constraints: Arc::new(HashMap::new()),
                        });
                    }
                    true
                });
            }
            TypeClass::Typedef | TypeClass::Builtin => {}
        }

        Ok(members)
    }

    fn read_typed_member(
        &self,
        file: &Arc<IdlFile>,
        generic_vars: &[String],
        name: &str,
        value: &Object,
    ) -> Result<Member, RpcError> {
        let (type_decl, description, constraints) = match value.kind() {
            ObjectKind::String => (
                value.as_str().unwrap_or_default().to_string(),
                String::new(),
                Arc::new(HashMap::new()),
            ),
            ObjectKind::Dictionary => {
                let type_decl = value
                    .dict_get("type")
                    .and_then(|t| t.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        RpcError::invalid(format!(
                            "Required 'type' field of member {} missing",
                            name
                        ))
                    })?;
                let description = value
                    .dict_get("description")
                    .and_then(|d| d.as_str().map(str::to_string))
                    .unwrap_or_default();
                (type_decl, description, read_constraints(value))
            }
            other => {
                return Err(RpcError::invalid(format!(
                    "Malformed member {}: unexpected {}",
                    name, other
                )))
            }
        };

        let typei = self.instantiate_in(&type_decl, None, Some(generic_vars), Some(file))?;

        Ok(Member {
            name: name.to_string(),
            description,
            typei: Some(typei),
            constraints,
        })
    }

    pub(crate) fn read_interface(
        &self,
        file: &Arc<IdlFile>,
        decl: &str,
        obj: &Object,
    ) -> Result<(), RpcError> {
        let caps = INTERFACE_REGEX
            .captures(decl)
            .ok_or_else(|| RpcError::invalid(format!("Cannot parse: {}", decl)))?;
        let name = file.qualify(&caps[1]);

        if self.interfaces.read().unwrap().contains_key(&name) {
            return Ok(());
        }

        let description = obj
            .dict_get("description")
            .and_then(|d| d.as_str().map(str::to_string))
            .unwrap_or_default();

        let mut members = HashMap::new();
        let mut failure = None;
        obj.dict_apply(|key, value| {
            let result = if key.starts_with("property") {
                self.read_property(file, key, value).map(Some)
            } else if key.starts_with("method") {
                self.read_method(file, key, value).map(Some)
            } else if key.starts_with("event") {
                self.read_event(file, key, value).map(Some)
            } else {
                Ok(None)
            };

            match result {
                Ok(Some(member)) => {
                    members.insert(member.name.clone(), Arc::new(member));
                    true
                }
                Ok(None) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }

        let iface = Arc::new(Interface {
            name: name.clone(),
            description,
            origin: file.origin_for(obj),
            members,
        });

        self.interfaces.write().unwrap().insert(name, iface);
        Ok(())
    }

    fn read_method(
        &self,
        file: &Arc<IdlFile>,
        decl: &str,
        obj: &Object,
    ) -> Result<IfMember, RpcError> {
        debug!(decl, path = %file.path.display(), "reading method");

        let caps = METHOD_REGEX
            .captures(decl)
            .ok_or_else(|| RpcError::invalid(format!("Cannot parse: {}", decl)))?;
        let name = caps[1].to_string();

        let description = obj
            .dict_get("description")
            .and_then(|d| d.as_str().map(str::to_string))
            .unwrap_or_default();

        let mut arguments = Vec::new();
        if let Some(args) = obj.dict_get("args") {
            let mut failure = None;
            args.array_apply(|idx, arg| {
                let arg_name = match arg.dict_get("name").and_then(|n| n.as_str().map(str::to_string)) {
                    Some(n) => n,
                    None => {
                        failure = Some(RpcError::invalid(format!(
                            "Required 'name' field in argument {} of {} missing",
                            idx, name
                        )));
                        return false;
                    }
                };
                let arg_type = match arg.dict_get("type").and_then(|t| t.as_str().map(str::to_string)) {
                    Some(t) => t,
                    None => {
                        failure = Some(RpcError::invalid(format!(
                            "Required 'type' field in argument {} of {} missing",
                            idx, name
                        )));
                        return false;
                    }
                };

                match self.instantiate_in(&arg_type, None, None, Some(file)) {
                    Ok(typei) => {
                        arguments.push(Argument {
                            name: arg_name,
                            description: arg
                                .dict_get("description")
                                .and_then(|d| d.as_str().map(str::to_string))
                                .unwrap_or_default(),
                            typei,
                        });
                        true
                    }
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let result = match obj.dict_get("return") {
            Some(returns) => {
                let returns_type = returns
                    .dict_get("type")
                    .and_then(|t| t.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        RpcError::invalid(format!(
                            "Cannot instantiate return type of method {}",
                            name
                        ))
                    })?;
                Some(
                    self.instantiate_in(&returns_type, None, None, Some(file))
                        .map_err(|e| {
                            RpcError::new(
                                e.code,
                                format!(
                                    "Cannot instantiate return type {} of method {}: {}",
                                    returns_type, name, e.message
                                ),
                            )
                        })?,
                )
            }
            None => None,
        };

        Ok(IfMember {
            name,
            description,
            kind: IfMemberKind::Method { arguments, result },
        })
    }

    fn read_property(
        &self,
        file: &Arc<IdlFile>,
        decl: &str,
        obj: &Object,
    ) -> Result<IfMember, RpcError> {
        let caps = PROPERTY_REGEX
            .captures(decl)
            .ok_or_else(|| RpcError::invalid(format!("Cannot parse: {}", decl)))?;
        let name = caps[1].to_string();

        let read_only = obj.dict_get("read-only").and_then(|v| v.as_bool()).unwrap_or(false);
        let read_write = obj.dict_get("read-write").and_then(|v| v.as_bool()).unwrap_or(false);
        let write_only = obj.dict_get("write-only").and_then(|v| v.as_bool()).unwrap_or(false);
        let notify = obj.dict_get("notify").and_then(|v| v.as_bool()).unwrap_or(false);

        let access = if read_only {
            AccessRights::ReadOnly
        } else if write_only {
            AccessRights::WriteOnly
        } else if read_write {
            AccessRights::ReadWrite
        } else {
            return Err(RpcError::invalid(format!(
                "Property {} has no access rights defined",
                name
            )));
        };

        let result = obj
            .dict_get("type")
            .and_then(|t| t.as_str().map(str::to_string))
            .map(|t| self.instantiate_in(&t, None, None, Some(file)))
            .transpose()?;

        Ok(IfMember {
            name: name.clone(),
            description: obj
                .dict_get("description")
                .and_then(|d| d.as_str().map(str::to_string))
                .unwrap_or_default(),
            kind: IfMemberKind::Property {
                result,
                access,
                notify,
            },
        })
    }

    fn read_event(
        &self,
        file: &Arc<IdlFile>,
        decl: &str,
        obj: &Object,
    ) -> Result<IfMember, RpcError> {
        let caps = EVENT_REGEX
            .captures(decl)
            .ok_or_else(|| RpcError::invalid(format!("Cannot parse: {}", decl)))?;
        let name = caps[1].to_string();

        let payload = obj
            .dict_get("type")
            .and_then(|t| t.as_str().map(str::to_string))
            .map(|t| self.instantiate_in(&t, None, None, Some(file)))
            .transpose()?;

        Ok(IfMember {
            name: name.clone(),
            description: obj
                .dict_get("description")
                .and_then(|d| d.as_str().map(str::to_string))
                .unwrap_or_default(),
            kind: IfMemberKind::Event { payload },
        })
    }
}

fn read_constraints(obj: &Object) -> Arc<HashMap<String, Object>> {
    let mut constraints = HashMap::new();
    if let Some(decls) = obj.dict_get("constraints") {
        decls.dict_apply(|key, value| {
            constraints.insert(key.to_string(), value.clone());
            true
        });
    }
    Arc::new(constraints)
}
